//! Incremental stream assembler — turns raw model text into structured
//! elements as chunks arrive.
//!
//! The grammar is deliberately restricted: a flat vocabulary of recognized
//! tag names, `key="value"` attributes on opening delimiters, and literal
//! text everywhere else. Unrecognized or malformed delimiters fall through
//! as plain text rather than erroring.
//!
//! Invariant: feeding the same response under any chunking yields an
//! identical emitted event sequence. A `<` that has not yet been
//! disambiguated is buffered across chunk boundaries until its delimiter
//! closes (or is ruled out).

use std::collections::{BTreeMap, HashSet};

use tracing::trace;

/// Tag under which top-level untagged text is emitted.
pub const THOUGHT_TAG: &str = "thought";

/// A completed (or abandoned) element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementEvent {
    /// Element tag, or [`THOUGHT_TAG`] for untagged top-level text.
    pub tag: String,
    /// Attributes parsed from the opening delimiter.
    pub attributes: BTreeMap<String, String>,
    /// Accumulated text content.
    pub content: String,
    /// False when the stream ended before the closing delimiter.
    pub done: bool,
}

struct PartialElement {
    tag: String,
    attributes: BTreeMap<String, String>,
    content: String,
}

enum Delimiter {
    Open {
        tag: String,
        attributes: BTreeMap<String, String>,
        self_closing: bool,
    },
    Close {
        tag: String,
    },
}

/// Streaming stack-based assembler over the element grammar.
pub struct StreamAssembler {
    vocabulary: HashSet<String>,
    stack: Vec<PartialElement>,
    top_text: String,
    pending: String,
}

impl StreamAssembler {
    /// Assembler recognizing exactly the tags in `vocabulary`.
    #[must_use]
    pub fn new(vocabulary: HashSet<String>) -> Self {
        Self {
            vocabulary,
            stack: Vec::new(),
            top_text: String::new(),
            pending: String::new(),
        }
    }

    /// Feed one chunk; returns the elements completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<ElementEvent> {
        let mut events = Vec::new();
        for c in chunk.chars() {
            self.feed_char(c, &mut events);
        }
        events
    }

    /// Signal end of stream. Buffered delimiter text becomes literal text,
    /// remaining top-level text is emitted as a thought, and unterminated
    /// elements are emitted innermost-first with `done = false`.
    pub fn finish(&mut self) -> Vec<ElementEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let literal = std::mem::take(&mut self.pending);
            self.push_text(&literal);
        }
        while let Some(partial) = self.stack.pop() {
            trace!(tag = %partial.tag, "unterminated element at end of stream");
            events.push(ElementEvent {
                tag: partial.tag,
                attributes: partial.attributes,
                content: partial.content,
                done: false,
            });
        }
        self.flush_thought(&mut events);
        events
    }

    /// Number of currently open elements.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn feed_char(&mut self, c: char, events: &mut Vec<ElementEvent>) {
        if !self.pending.is_empty() {
            if c == '<' {
                // The buffered run was not a delimiter after all.
                let literal = std::mem::take(&mut self.pending);
                self.push_text(&literal);
                self.pending.push('<');
                return;
            }
            self.pending.push(c);
            if c == '>' {
                let raw = std::mem::take(&mut self.pending);
                self.handle_delimiter(&raw, events);
            }
            return;
        }
        if c == '<' {
            self.pending.push('<');
            return;
        }
        self.push_char(c);
    }

    fn handle_delimiter(&mut self, raw: &str, events: &mut Vec<ElementEvent>) {
        match parse_delimiter(raw) {
            Some(Delimiter::Close { tag }) => {
                let matches_top = self.stack.last().is_some_and(|p| p.tag == tag);
                if matches_top {
                    if let Some(partial) = self.stack.pop() {
                        events.push(ElementEvent {
                            tag: partial.tag,
                            attributes: partial.attributes,
                            content: partial.content,
                            done: true,
                        });
                    }
                } else {
                    self.push_text(raw);
                }
            }
            Some(Delimiter::Open {
                tag,
                attributes,
                self_closing,
            }) => {
                if !self.vocabulary.contains(&tag) {
                    self.push_text(raw);
                    return;
                }
                if self.stack.is_empty() {
                    self.flush_thought(events);
                }
                if self_closing {
                    events.push(ElementEvent {
                        tag,
                        attributes,
                        content: String::new(),
                        done: true,
                    });
                } else {
                    self.stack.push(PartialElement {
                        tag,
                        attributes,
                        content: String::new(),
                    });
                }
            }
            None => self.push_text(raw),
        }
    }

    fn push_char(&mut self, c: char) {
        match self.stack.last_mut() {
            Some(partial) => partial.content.push(c),
            None => self.top_text.push(c),
        }
    }

    fn push_text(&mut self, text: &str) {
        match self.stack.last_mut() {
            Some(partial) => partial.content.push_str(text),
            None => self.top_text.push_str(text),
        }
    }

    fn flush_thought(&mut self, events: &mut Vec<ElementEvent>) {
        if self.top_text.trim().is_empty() {
            self.top_text.clear();
            return;
        }
        events.push(ElementEvent {
            tag: THOUGHT_TAG.to_string(),
            attributes: BTreeMap::new(),
            content: std::mem::take(&mut self.top_text),
            done: true,
        });
    }
}

/// Parse one `<...>` run. `None` means the run is literal text.
fn parse_delimiter(raw: &str) -> Option<Delimiter> {
    let inner = raw.strip_prefix('<')?.strip_suffix('>')?;
    if inner.is_empty() {
        return None;
    }
    if let Some(name) = inner.strip_prefix('/') {
        let name = name.trim();
        if !valid_tag_name(name) {
            return None;
        }
        return Some(Delimiter::Close {
            tag: name.to_string(),
        });
    }
    let (body, self_closing) = match inner.strip_suffix('/') {
        Some(b) => (b, true),
        None => (inner, false),
    };
    let body = body.trim();
    let (name, rest) = match body.find(char::is_whitespace) {
        Some(i) => (&body[..i], &body[i..]),
        None => (body, ""),
    };
    if !valid_tag_name(name) {
        return None;
    }
    let attributes = parse_attributes(rest)?;
    Some(Delimiter::Open {
        tag: name.to_string(),
        attributes,
        self_closing,
    })
}

fn valid_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `key="value"` pairs separated by whitespace. `None` on any malformation.
fn parse_attributes(rest: &str) -> Option<BTreeMap<String, String>> {
    let mut attributes = BTreeMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            let _ = chars.next();
        }
        if chars.peek().is_none() {
            return Some(attributes);
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return None;
            }
            key.push(c);
            let _ = chars.next();
        }
        if key.is_empty() || chars.next() != Some('=') || chars.next() != Some('"') {
            return None;
        }
        let mut value = String::new();
        loop {
            match chars.next() {
                Some('"') => break,
                Some(c) => value.push(c),
                None => return None,
            }
        }
        let _ = attributes.insert(key, value);
    }
}
