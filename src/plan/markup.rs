//! Tolerant markup parsing for plan documents.
//!
//! The planner produces the plan document incrementally, so the parser must
//! accept truncated input: a prefix may end in the middle of a tag, an
//! attribute value, or text. Parsing is an explicit scan over the input that
//! builds an element tree in place; in partial mode a trailing incomplete
//! tag or attribute is completed from whatever was received and every open
//! element is auto-closed. In final mode the same conditions are errors.

use crate::error::{Error, Result};

/// An element in the plan document: name, ordered attributes, children.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All direct child elements with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter_map(move |c| match c {
            Node::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    pub fn child<'a>(&'a self, name: &'a str) -> Option<&'a Element> {
        self.children_named(name).next()
    }

    /// Concatenated, trimmed text content of direct text children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let Node::Text(t) = child {
                out.push_str(t);
            }
        }
        out.trim().to_string()
    }
}

/// Parse a (possibly truncated) document, returning its first top-level
/// element. `Ok(None)` means no element has appeared yet, not an error.
pub fn parse(input: &str, is_final: bool) -> Result<Option<Element>> {
    Parser {
        chars: input.char_indices().peekable(),
        is_final,
    }
    .run()
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    is_final: bool,
}

impl<'a> Parser<'a> {
    fn run(mut self) -> Result<Option<Element>> {
        // Stack of open elements; index 0 is the root once it appears.
        let mut stack: Vec<Element> = Vec::new();
        let mut text = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch == '<' {
                if !stack.is_empty() && !text.is_empty() {
                    let top = stack.last_mut().expect("non-empty stack");
                    top.children.push(Node::Text(unescape(&text)));
                }
                text.clear();

                match self.tag()? {
                    Tag::Open(element, self_closing) => {
                        if self_closing {
                            match stack.last_mut() {
                                Some(parent) => parent.children.push(Node::Element(element)),
                                // Self-closing root: complete document.
                                None => return Ok(Some(element)),
                            }
                        } else {
                            stack.push(element);
                        }
                    }
                    Tag::Close(name) => {
                        if let Some(done) = close_named(&mut stack, &name, self.is_final)? {
                            return Ok(Some(done));
                        }
                    }
                    Tag::Skip => {}
                    Tag::Truncated => break,
                }
            } else {
                self.chars.next();
                text.push(ch);
            }
        }

        if stack.is_empty() {
            return Ok(None);
        }
        if self.is_final {
            return Err(Error::PlanParse(format!(
                "unclosed element '{}' at end of document",
                stack.last().expect("non-empty stack").name
            )));
        }

        // Partial mode: attach straggling text, then auto-close everything.
        if !text.trim().is_empty() {
            let top = stack.last_mut().expect("non-empty stack");
            top.children.push(Node::Text(unescape(&text)));
        }
        while stack.len() > 1 {
            let done = stack.pop().expect("len > 1");
            let parent = stack.last_mut().expect("len >= 1");
            parent.children.push(Node::Element(done));
        }
        Ok(stack.pop())
    }

    /// Parse one tag starting at the current `<`.
    fn tag(&mut self) -> Result<Tag> {
        self.chars.next(); // consume '<'

        match self.chars.peek() {
            None => self.truncated("dangling '<' at end of document"),
            Some(&(_, '/')) => {
                self.chars.next();
                let name = self.name();
                // Scan for '>'; tolerate whitespace, nothing else matters.
                loop {
                    match self.chars.next() {
                        Some((_, '>')) => return Ok(Tag::Close(name)),
                        Some(_) => {}
                        None => return self.truncated("unterminated closing tag"),
                    }
                }
            }
            Some(&(_, '!')) | Some(&(_, '?')) => {
                // Comment / processing instruction: skip to '>'.
                loop {
                    match self.chars.next() {
                        Some((_, '>')) => return Ok(Tag::Skip),
                        Some(_) => {}
                        None => return self.truncated("unterminated declaration"),
                    }
                }
            }
            Some(_) => self.open_tag(),
        }
    }

    fn open_tag(&mut self) -> Result<Tag> {
        let name = self.name();
        if name.is_empty() {
            // Stray '<' in text ("a < b"). Treat the rest as text by
            // skipping just the bracket; callers already consumed it, so
            // report a skippable tag and let text resume.
            return Ok(Tag::Skip);
        }
        let mut element = Element::new(name);

        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                None => {
                    // Tag truncated after complete attributes: keep what we
                    // have, auto-close later.
                    return match self.truncated("unterminated tag")? {
                        Tag::Truncated if !self.is_final => Ok(Tag::Open(element, false)),
                        other => Ok(other),
                    };
                }
                Some(&(_, '>')) => {
                    self.chars.next();
                    return Ok(Tag::Open(element, false));
                }
                Some(&(_, '/')) => {
                    self.chars.next();
                    match self.chars.next() {
                        Some((_, '>')) => return Ok(Tag::Open(element, true)),
                        _ => return self.truncated("malformed self-closing tag"),
                    }
                }
                Some(_) => {
                    let attr_name = self.name();
                    if attr_name.is_empty() {
                        // Unparseable junk inside the tag.
                        if self.is_final {
                            return Err(Error::PlanParse(format!(
                                "malformed attribute in <{}>",
                                element.name
                            )));
                        }
                        self.chars.next();
                        continue;
                    }
                    self.skip_whitespace();
                    let value = if matches!(self.chars.peek(), Some(&(_, '='))) {
                        self.chars.next();
                        self.skip_whitespace();
                        match self.attr_value() {
                            AttrValue::Complete(v) => v,
                            // Truncated inside the value: keep the partial
                            // value in partial mode.
                            AttrValue::Truncated(v) if !self.is_final => {
                                element.attrs.push((attr_name, unescape(&v)));
                                return Ok(Tag::Open(element, false));
                            }
                            AttrValue::Truncated(_) => {
                                return Err(Error::PlanParse(format!(
                                    "unterminated attribute value in <{}>",
                                    element.name
                                )))
                            }
                        }
                    } else {
                        String::new()
                    };
                    element.attrs.push((attr_name, unescape(&value)));
                }
            }
        }
    }

    /// Quoted attribute value; `Truncated` carries whatever arrived before
    /// the input ran out.
    fn attr_value(&mut self) -> AttrValue {
        let quote = match self.chars.peek() {
            Some(&(_, q @ '"')) | Some(&(_, q @ '\'')) => {
                self.chars.next();
                q
            }
            _ => return AttrValue::Complete(String::new()),
        };
        let mut value = String::new();
        for (_, ch) in self.chars.by_ref() {
            if ch == quote {
                return AttrValue::Complete(value);
            }
            value.push(ch);
        }
        AttrValue::Truncated(value)
    }

    fn name(&mut self) -> String {
        let mut name = String::new();
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                name.push(ch);
                self.chars.next();
            } else {
                break;
            }
        }
        name
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(&(_, ch)) if ch.is_whitespace()) {
            self.chars.next();
        }
    }

    fn truncated(&self, message: &str) -> Result<Tag> {
        if self.is_final {
            Err(Error::PlanParse(message.to_string()))
        } else {
            Ok(Tag::Truncated)
        }
    }
}

enum Tag {
    Open(Element, bool),
    Close(String),
    Skip,
    Truncated,
}

enum AttrValue {
    Complete(String),
    Truncated(String),
}

/// Close the innermost element matching `name`, reparenting anything opened
/// after it. Returns the root element when the outermost element closes.
fn close_named(stack: &mut Vec<Element>, name: &str, is_final: bool) -> Result<Option<Element>> {
    let Some(position) = stack.iter().rposition(|e| e.name == name) else {
        if is_final {
            return Err(Error::PlanParse(format!("unmatched closing tag </{name}>")));
        }
        return Ok(None);
    };

    // Implicitly close anything opened after the matching element.
    while stack.len() > position + 1 {
        let done = stack.pop().expect("len > position + 1");
        let parent = stack.last_mut().expect("len >= 1");
        parent.children.push(Node::Element(done));
    }

    let done = stack.pop().expect("element at position");
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(done));
            Ok(None)
        }
        None => Ok(Some(done)),
    }
}

pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn escape_attr(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let replaced = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
        ]
        .iter()
        .find(|(entity, _)| rest.starts_with(entity));
        match replaced {
            Some((entity, ch)) => {
                out.push(*ch);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
