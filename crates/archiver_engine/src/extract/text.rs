use ego_tree::iter::Edge;
use scraper::node::Node;
use scraper::{ElementRef, Html};

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "details", "div", "dl", "dt",
    "figcaption", "figure", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li",
    "main", "nav", "ol", "p", "pre", "section", "summary", "table", "td", "th", "tr", "ul",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "iframe"];

/// Plain-text rendering of an HTML fragment: one line per block, whitespace
/// collapsed inside lines.
pub fn derive_text(fragment: &str) -> String {
    let doc = Html::parse_fragment(fragment);
    let mut ctx = TextContext::default();
    let mut skip_depth = 0usize;

    for edge in doc.root_element().traverse() {
        match edge {
            Edge::Open(node) => match node.value() {
                Node::Text(text) if skip_depth == 0 => ctx.append_text(text),
                Node::Element(element) => {
                    let name = element.name();
                    if skip_depth > 0 || SKIPPED_TAGS.contains(&name) {
                        skip_depth += 1;
                    } else if name == "br" || BLOCK_TAGS.contains(&name) {
                        ctx.ensure_newline();
                    }
                }
                _ => {}
            },
            Edge::Close(node) => {
                let Some(element) = ElementRef::wrap(node) else {
                    continue;
                };
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else if BLOCK_TAGS.contains(&element.value().name()) {
                    ctx.ensure_newline();
                }
            }
        }
    }
    ctx.into_text()
}

#[derive(Default)]
struct TextContext {
    builder: String,
    pending_space: bool,
}

impl TextContext {
    fn append_text(&mut self, text: &str) {
        if text.starts_with(char::is_whitespace) {
            self.pending_space = true;
        }
        for word in text.split_whitespace() {
            if self.pending_space && !self.builder.is_empty() && !self.builder.ends_with('\n') {
                self.builder.push(' ');
            }
            self.builder.push_str(word);
            self.pending_space = true;
        }
        if !text.ends_with(char::is_whitespace) && !text.trim().is_empty() {
            self.pending_space = false;
        }
    }

    fn ensure_newline(&mut self) {
        let trimmed = self.builder.trim_end_matches(' ').len();
        self.builder.truncate(trimmed);
        if !self.builder.is_empty() && !self.builder.ends_with('\n') {
            self.builder.push('\n');
        }
        self.pending_space = false;
    }

    fn into_text(self) -> String {
        self.builder.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_become_lines() {
        let text = derive_text("<h1>Title</h1><p>First   paragraph\n here.</p><p>Second</p>");
        assert_eq!(text, "Title\nFirst paragraph here.\nSecond");
    }

    #[test]
    fn inline_elements_keep_spacing() {
        assert_eq!(derive_text("<p>Hello <b>world</b>!</p>"), "Hello world!");
        assert_eq!(derive_text("<p>un<i>break</i>able</p>"), "unbreakable");
    }

    #[test]
    fn scripts_and_styles_are_ignored() {
        let text = derive_text("<p>a<script>var x = 1;</script><style>p{}</style>b</p>");
        assert_eq!(text, "ab");
    }

    #[test]
    fn line_breaks_split_lines() {
        assert_eq!(derive_text("<p>one<br>two</p>"), "one\ntwo");
    }
}
