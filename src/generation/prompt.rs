use minijinja::{context, Environment, Error as TemplateError, ErrorKind as TemplateErrorKind};
use serde::Serialize;
use std::fmt;
use tracing::warn;

/// Model input text plus how the tokenizer has to treat it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub text: String,
    /// The text already carries BOS and friends; the tokenizer must not add
    /// them again.
    pub has_special_tokens: bool,
}

impl RenderedPrompt {
    fn plain(text: String) -> Self {
        Self {
            text,
            has_special_tokens: false,
        }
    }
}

/// Turns a user prompt and optional system preamble into model input text.
pub trait PromptFormat: Send + Sync {
    fn render(&self, system: Option<&str>, prompt: &str) -> RenderedPrompt;
}

/// `User:` / `Assistant:` turns, for models without a chat template.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormat;

impl PlainFormat {
    fn text(system: Option<&str>, prompt: &str) -> String {
        match system.filter(|s| !s.trim().is_empty()) {
            Some(system) => format!("{}\n\nUser: {}\nAssistant:", system, prompt),
            None => format!("User: {}\nAssistant:", prompt),
        }
    }
}

impl PromptFormat for PlainFormat {
    fn render(&self, system: Option<&str>, prompt: &str) -> RenderedPrompt {
        RenderedPrompt::plain(Self::text(system, prompt))
    }
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

/// The model's own Jinja chat template.
pub struct ChatTemplateFormat {
    env: Environment<'static>,
    template: String,
    bos_token: String,
    eos_token: String,
}

impl fmt::Debug for ChatTemplateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatTemplateFormat")
            .field("template_len", &self.template.len())
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

impl ChatTemplateFormat {
    pub fn new(template: String, bos_token: String, eos_token: String) -> Self {
        let mut env = Environment::new();
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function("raise_exception", |message: String| -> Result<String, TemplateError> {
            Err(TemplateError::new(TemplateErrorKind::InvalidOperation, message))
        });
        env.add_function("strftime_now", |format: String| {
            chrono::Local::now().format(&format).to_string()
        });
        Self {
            env,
            template,
            bos_token,
            eos_token,
        }
    }

    pub fn try_render(&self, system: Option<&str>, prompt: &str) -> Result<String, TemplateError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt,
        });

        self.env.render_str(
            &self.template,
            context!(
                messages => messages,
                add_generation_prompt => true,
                bos_token => self.bos_token,
                eos_token => self.eos_token,
            ),
        )
    }
}

impl PromptFormat for ChatTemplateFormat {
    fn render(&self, system: Option<&str>, prompt: &str) -> RenderedPrompt {
        match self.try_render(system, prompt) {
            Ok(text) => RenderedPrompt {
                text,
                has_special_tokens: !self.bos_token.is_empty() && self.template.contains("bos_token"),
            },
            Err(e) => {
                warn!("Chat template failed ({}), using the plain prompt format", e);
                PlainFormat.render(system, prompt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATML: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

    #[test]
    fn test_plain_format() {
        assert_eq!(PlainFormat.render(None, "hi").text, "User: hi\nAssistant:");
        assert_eq!(
            PlainFormat.render(Some("Be brief."), "hi").text,
            "Be brief.\n\nUser: hi\nAssistant:"
        );
        assert_eq!(PlainFormat.render(Some("  "), "hi").text, "User: hi\nAssistant:");
        assert!(!PlainFormat.render(None, "hi").has_special_tokens);
    }

    #[test]
    fn test_chatml_template() {
        let format = ChatTemplateFormat::new(CHATML.to_string(), String::new(), "<|im_end|>".to_string());
        let rendered = format.render(Some("sys"), "hello");
        assert_eq!(
            rendered.text,
            "<|im_start|>system\nsys<|im_end|>\n<|im_start|>user\nhello<|im_end|>\n<|im_start|>assistant\n"
        );
        assert!(!rendered.has_special_tokens);
    }

    #[test]
    fn test_raise_exception_falls_back_to_plain() {
        let template = "{% if messages[0].role == 'system' %}{{ raise_exception('System role not supported') }}{% endif %}{{ bos_token }}[INST] {{ messages[0].content }} [/INST]";
        let format = ChatTemplateFormat::new(template.to_string(), "<s>".to_string(), "</s>".to_string());
        assert!(format.try_render(Some("sys"), "hello").is_err());

        let fallback = format.render(Some("sys"), "hello");
        assert_eq!(fallback.text, "sys\n\nUser: hello\nAssistant:");
        assert!(!fallback.has_special_tokens, "plain fallback needs the tokenizer's BOS");

        let templated = format.render(None, "hello");
        assert_eq!(templated.text, "<s>[INST] hello [/INST]");
        assert!(templated.has_special_tokens);
    }

    #[test]
    fn test_pycompat_methods() {
        let template = "{% for message in messages %}{{ message.content.strip() }}{% endfor %}";
        let format = ChatTemplateFormat::new(template.to_string(), String::new(), String::new());
        assert_eq!(format.render(None, "  padded  ").text, "padded");
    }
}
