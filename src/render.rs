/// Longest preview kept in the message list.
pub const MAX_PREVIEW_CHARS: usize = 512;

/// What the store persists alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedContent {
    pub preview: Option<String>,
    pub display_html: Option<String>,
}

/// Turns raw body text into the preview and display HTML the store keeps.
pub trait ContentRenderer: Send + Sync {
    fn render(&self, text: &str, html: &str) -> RenderedContent;
}

/// Sanitized plain-text preview, HTML passed through for display.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRenderer;

impl ContentRenderer for DefaultRenderer {
    fn render(&self, text: &str, html: &str) -> RenderedContent {
        if text.is_empty() && html.is_empty() {
            return RenderedContent::default();
        }
        let plain = html_safe_md::render_email_plain(non_empty(text), non_empty(html));
        let preview = collapse_preview(&plain);

        let display_html = if !html.is_empty() {
            Some(html.to_string())
        } else {
            Some(format!("<pre>{}</pre>", escape_html(text)))
        };

        RenderedContent {
            preview: (!preview.is_empty()).then_some(preview),
            display_html,
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Collapse runs of whitespace and cap the length.
pub fn collapse_preview(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_PREVIEW_CHARS)
        .collect()
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_preferred_over_html() {
        let r = DefaultRenderer.render("Hello, world", "<p>Hello, world</p>");
        assert_eq!(r.preview.as_deref(), Some("Hello, world"));
        assert_eq!(r.display_html.as_deref(), Some("<p>Hello, world</p>"));
    }

    #[test]
    fn html_only_still_gets_a_preview() {
        let r = DefaultRenderer.render("", "<p>Hello</p>");
        let preview = r.preview.expect("preview from html");
        assert!(preview.contains("Hello"));
        assert!(!preview.contains("<p>"));
    }

    #[test]
    fn text_only_is_escaped_for_display() {
        let r = DefaultRenderer.render("a < b", "");
        assert_eq!(r.display_html.as_deref(), Some("<pre>a &lt; b</pre>"));
    }

    #[test]
    fn no_content_renders_nothing() {
        assert_eq!(DefaultRenderer.render("", ""), RenderedContent::default());
    }

    #[test]
    fn preview_is_collapsed_and_capped() {
        assert_eq!(collapse_preview("Line one\n\n  Line two"), "Line one Line two");
        let long = "x".repeat(MAX_PREVIEW_CHARS + 40);
        assert_eq!(collapse_preview(&long).chars().count(), MAX_PREVIEW_CHARS);
    }
}
