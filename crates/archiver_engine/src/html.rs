use ego_tree::iter::Edge;
use ego_tree::{NodeId, NodeRef};
use scraper::node::Node;
use scraper::ElementRef;

/// Elements that never carry children or a closing tag.
pub(crate) const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visit {
    /// Write the element and its subtree.
    Keep,
    /// Skip the tags but keep walking the children.
    Unwrap,
    /// Skip the whole subtree.
    Drop,
}

pub(crate) trait NodeFilter {
    fn visit(&mut self, element: ElementRef<'_>) -> Visit;

    fn keep_attribute(&mut self, _element: ElementRef<'_>, _name: &str, _value: &str) -> bool {
        true
    }
}

/// Serializes `root` (and, if `include_root`, its own tags) through `filter`.
///
/// Walks with an explicit edge iterator so deeply nested input cannot
/// exhaust the stack. Comments, doctypes and processing instructions are
/// never emitted; attributes are written in name order so output is stable.
pub(crate) fn serialize(
    root: NodeRef<'_, Node>,
    include_root: bool,
    filter: &mut dyn NodeFilter,
) -> String {
    let mut out = String::new();
    let mut dropped: Option<NodeId> = None;
    let mut open: Vec<(NodeId, bool)> = Vec::new();

    for edge in root.traverse() {
        match edge {
            Edge::Open(node) => {
                if dropped.is_some() {
                    continue;
                }
                match node.value() {
                    Node::Text(text) => escape_text(&mut out, text),
                    Node::Element(_) => {
                        let Some(element) = ElementRef::wrap(node) else {
                            continue;
                        };
                        let visit = if !include_root && node.id() == root.id() {
                            Visit::Unwrap
                        } else {
                            filter.visit(element)
                        };
                        match visit {
                            Visit::Drop => dropped = Some(node.id()),
                            Visit::Unwrap => open.push((node.id(), false)),
                            Visit::Keep => {
                                write_start_tag(&mut out, element, filter);
                                open.push((node.id(), true));
                            }
                        }
                    }
                    _ => {}
                }
            }
            Edge::Close(node) => {
                if let Some(id) = dropped {
                    if id == node.id() {
                        dropped = None;
                    }
                    continue;
                }
                let Some(element) = ElementRef::wrap(node) else {
                    continue;
                };
                if let Some((id, written)) = open.pop() {
                    debug_assert_eq!(id, node.id());
                    let name = element.value().name();
                    if written && !VOID_ELEMENTS.contains(&name) {
                        out.push_str("</");
                        out.push_str(name);
                        out.push('>');
                    }
                }
            }
        }
    }
    out
}

fn write_start_tag(out: &mut String, element: ElementRef<'_>, filter: &mut dyn NodeFilter) {
    let name = element.value().name();
    out.push('<');
    out.push_str(name);
    let mut attrs: Vec<(&str, &str)> = element.value().attrs().collect();
    attrs.sort_unstable_by(|a, b| a.0.cmp(b.0));
    for (attr, value) in attrs {
        if !is_valid_attribute_name(attr) || !filter.keep_attribute(element, attr, value) {
            continue;
        }
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        escape_attribute(out, value);
        out.push('"');
    }
    out.push('>');
}

fn is_valid_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '>' | '/' | '=' | '<'))
}

pub(crate) fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

/// Visible text of a subtree with whitespace runs collapsed to single spaces.
pub(crate) fn collapsed_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for chunk in element.text() {
        for word in chunk.split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
    }
    out
}
