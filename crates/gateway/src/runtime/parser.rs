//! Response parser — a state machine over the LLM event stream.
//!
//! Two calling conventions are recognized concurrently:
//!
//! - **JSON tool calls**: the provider adapter assembles `tool_calls`
//!   deltas and reports each finished call with its raw argument text;
//!   this parser decodes the arguments strictly, attaching a coercion
//!   error instead of dropping the call when decoding fails.
//! - **XML tool tags**: assistant text is scanned incrementally for
//!   registered tags. Tag occurrences are stripped from the emitted text;
//!   attributes, child elements, and inner content map onto declared
//!   parameters with per-parameter type coercion.
//!
//! A tool call is emitted the moment its closing delimiter is observed —
//! mid-stream, not at end of stream — so execution can overlap ongoing
//! generation.
//!
//! Nested occurrences of the same tag are not supported: an opening tag
//! seen while that tag is already open rejects the whole occurrence with
//! a synthesized error result.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use relay_domain::stream::LlmEvent;
use relay_domain::tool::{coerce_xml_value, ToolCall, ToolResult, XmlNode};
use relay_tools::{ToolRegistry, ToolSpec};

/// What the parser yields while consuming the stream.
#[derive(Debug, Clone)]
pub enum ParserEvent {
    /// Assistant-visible text (tag occurrences already stripped).
    Text { text: String },
    /// Reasoning content, passed through untouched.
    Thinking { text: String },
    /// A complete tool call, ready for dispatch.
    Call(ToolCall),
    /// A result synthesized by the parser itself — required-parameter
    /// misses, nesting rejections, truncation diagnostics. The handler is
    /// never invoked for these.
    Synthetic(ToolResult),
}

pub struct ResponseParser {
    registry: Arc<ToolRegistry>,
    json_enabled: bool,
    xml_enabled: bool,
    /// 0 = unlimited.
    max_xml_calls: usize,

    /// Registered tags, longest first so the longest match wins.
    tags: Vec<String>,
    attr_re: Regex,

    buffer: String,
    open: Option<OpenTag>,
    ordinals: HashMap<String, usize>,
    xml_calls_emitted: usize,
    truncation_reported: bool,
}

struct OpenTag {
    tag: String,
    spec: Arc<ToolSpec>,
    attrs: HashMap<String, String>,
    content: String,
}

enum TagMatch {
    /// `<tag ...>` matched; (tag, end offset of `>` in the buffer,
    /// self-closing).
    Opened(String, usize, bool),
    /// The buffer could still grow into a registered tag.
    NeedMore,
    /// Not a registered tag.
    NoMatch,
}

impl ResponseParser {
    pub fn new(registry: Arc<ToolRegistry>, json_enabled: bool, xml_enabled: bool, max_xml_calls: usize) -> Self {
        let mut tags = registry.xml_tags();
        tags.sort_by_key(|t| std::cmp::Reverse(t.len()));
        Self {
            registry,
            json_enabled,
            xml_enabled,
            max_xml_calls,
            tags,
            attr_re: Regex::new(r#"([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*"([^"]*)""#)
                .expect("attribute regex is valid"),
            buffer: String::new(),
            open: None,
            ordinals: HashMap::new(),
            xml_calls_emitted: 0,
            truncation_reported: false,
        }
    }

    /// Feed one provider event; returns the parser events it unlocked.
    pub fn push_event(&mut self, event: &LlmEvent) -> Vec<ParserEvent> {
        match event {
            LlmEvent::Token { text } => self.push_text(text),
            LlmEvent::Thinking { text } => vec![ParserEvent::Thinking { text: text.clone() }],
            LlmEvent::ToolCallFinished { call_id, tool_name, arguments } if self.json_enabled => {
                vec![self.finish_json_call(call_id, tool_name, arguments)]
            }
            // Started/Delta carry no complete information; Done is the
            // caller's loop-exit signal.
            _ => Vec::new(),
        }
    }

    /// Flush at end of stream: trailing text and unclosed-tag diagnostics.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();

        if let Some(open) = self.open.take() {
            let call_id = self.next_call_id(&open.tag);
            events.push(ParserEvent::Synthetic(ToolResult {
                call_id,
                tool_name: open.spec.name.clone(),
                success: false,
                payload: Value::Null,
                error: Some(format!("stream ended before </{}> was closed", open.tag)),
            }));
        }

        if !self.buffer.is_empty() {
            let text = std::mem::take(&mut self.buffer);
            events.push(ParserEvent::Text { text });
        }
        events
    }

    // ── JSON convention ────────────────────────────────────────────

    fn finish_json_call(&mut self, call_id: &str, tool_name: &str, raw_arguments: &str) -> ParserEvent {
        let trimmed = raw_arguments.trim();
        let mut call = if trimmed.is_empty() {
            ToolCall::json(call_id, tool_name, Value::Object(Default::default()))
        } else {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(arguments) => ToolCall::json(call_id, tool_name, arguments),
                Err(e) => {
                    let mut c = ToolCall::json(call_id, tool_name, Value::String(raw_arguments.to_owned()));
                    c.argument_error = Some(format!("arguments are not valid JSON: {e}"));
                    c
                }
            }
        };
        if call.argument_error.is_none() && !call.arguments.is_object() {
            call.argument_error = Some("arguments must decode to a JSON object".into());
        }
        ParserEvent::Call(call)
    }

    // ── XML convention ─────────────────────────────────────────────

    fn push_text(&mut self, chunk: &str) -> Vec<ParserEvent> {
        if !self.xml_enabled {
            return if chunk.is_empty() {
                Vec::new()
            } else {
                vec![ParserEvent::Text { text: chunk.to_owned() }]
            };
        }

        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            if self.open.is_some() {
                if !self.scan_for_close(&mut events) {
                    break;
                }
                continue;
            }
            if !self.scan_for_open(&mut events) {
                break;
            }
        }

        events
    }

    /// Scan for the next registered opening tag. Returns false when more
    /// input is needed.
    fn scan_for_open(&mut self, events: &mut Vec<ParserEvent>) -> bool {
        let Some(lt) = self.buffer.find('<') else {
            // No tag start anywhere: the whole buffer is plain text.
            if !self.buffer.is_empty() {
                let text = std::mem::take(&mut self.buffer);
                events.push(ParserEvent::Text { text });
            }
            return false;
        };

        if lt > 0 {
            let text: String = self.buffer.drain(..lt).collect();
            events.push(ParserEvent::Text { text });
        }

        match self.match_tag_at_start() {
            TagMatch::NeedMore => false,
            TagMatch::NoMatch => {
                // A literal '<' that opens no registered tag.
                let ch: String = self.buffer.drain(..1).collect();
                events.push(ParserEvent::Text { text: ch });
                true
            }
            TagMatch::Opened(tag, gt, self_closing) => {
                let opening: String = self.buffer.drain(..=gt).collect();
                let attrs = self.parse_attributes(&opening);
                let spec = self
                    .registry
                    .lookup_by_tag(&tag)
                    .expect("matched tag is registered");

                if self_closing {
                    events.extend(self.complete_tag(OpenTag { tag, spec, attrs, content: String::new() }));
                } else {
                    self.open = Some(OpenTag { tag, spec, attrs, content: String::new() });
                }
                true
            }
        }
    }

    /// Scan for the open tag's closing delimiter, moving buffered bytes
    /// into its content. Returns false when more input is needed.
    fn scan_for_close(&mut self, events: &mut Vec<ParserEvent>) -> bool {
        let open = self.open.as_mut().expect("called with an open tag");
        let closing = format!("</{}>", open.tag);

        match self.buffer.find(&closing) {
            Some(pos) => {
                let inner: String = self.buffer.drain(..pos).collect();
                self.buffer.drain(..closing.len());
                open.content.push_str(&inner);
                let open = self.open.take().expect("open tag present");
                events.extend(self.finalize_tag(open));
                true
            }
            None => {
                // Keep a tail that could be a partial closing marker; move
                // the safe prefix into the content buffer.
                let keep = partial_suffix_len(&self.buffer, &closing);
                let safe = self.buffer.len() - keep;
                let inner: String = self.buffer.drain(..safe).collect();
                open.content.push_str(&inner);
                false
            }
        }
    }

    /// Check whether the buffer (which starts with `<`) opens a
    /// registered tag.
    fn match_tag_at_start(&self) -> TagMatch {
        let after_lt = &self.buffer[1..];

        for tag in &self.tags {
            if after_lt.len() > tag.len() && after_lt.starts_with(tag.as_str()) {
                let rest = &after_lt[tag.len()..];
                let next = rest.as_bytes()[0];
                if next == b'>' {
                    return TagMatch::Opened(tag.clone(), tag.len() + 1, false);
                }
                if next.is_ascii_whitespace() || next == b'/' {
                    // Attributes or a self-closing marker: find the `>`.
                    match after_lt.find('>') {
                        Some(gt_rel) => {
                            let self_closing = after_lt[..gt_rel].trim_end().ends_with('/');
                            return TagMatch::Opened(tag.clone(), gt_rel + 1, self_closing);
                        }
                        None => return TagMatch::NeedMore,
                    }
                }
            }
        }

        // Could the buffer still grow into one of the tags?
        if self
            .tags
            .iter()
            .any(|tag| after_lt.len() <= tag.len() && tag.as_bytes().starts_with(after_lt.as_bytes()))
        {
            return TagMatch::NeedMore;
        }

        TagMatch::NoMatch
    }

    fn parse_attributes(&self, opening: &str) -> HashMap<String, String> {
        self.attr_re
            .captures_iter(opening)
            .map(|cap| (cap[1].to_owned(), cap[2].to_owned()))
            .collect()
    }

    /// A tag closed cleanly: reject nesting, then map parameters.
    fn finalize_tag(&mut self, open: OpenTag) -> Option<ParserEvent> {
        let reopening = format!("<{}", open.tag);
        let nested = open.content.match_indices(&reopening).any(|(idx, _)| {
            let after = open.content[idx + reopening.len()..].as_bytes().first();
            matches!(after, Some(b'>') | Some(b'/')) || after.is_some_and(|b| b.is_ascii_whitespace())
        });
        if nested {
            let call_id = self.next_call_id(&open.tag);
            return Some(ParserEvent::Synthetic(ToolResult {
                call_id,
                tool_name: open.spec.name.clone(),
                success: false,
                payload: Value::Null,
                error: Some(format!("nested <{}> tags are not supported", open.tag)),
            }));
        }
        self.complete_tag(open)
    }

    fn complete_tag(&mut self, open: OpenTag) -> Option<ParserEvent> {
        let call_id = self.next_call_id(&open.tag);

        // Truncate beyond the per-iteration XML call limit. One diagnostic
        // covers the whole truncated remainder.
        if self.max_xml_calls > 0 && self.xml_calls_emitted >= self.max_xml_calls {
            if self.truncation_reported {
                return None;
            }
            self.truncation_reported = true;
            return Some(ParserEvent::Synthetic(ToolResult {
                call_id,
                tool_name: open.spec.name.clone(),
                success: false,
                payload: Value::Null,
                error: Some(format!(
                    "xml tool call limit reached ({}); remaining tags in this response were not executed",
                    self.max_xml_calls
                )),
            }));
        }

        let xml = open.spec.xml.as_ref().expect("xml spec present for tagged tool");
        let mut arguments = serde_json::Map::new();

        for mapping in &xml.mappings {
            let raw: Option<String> = match &mapping.node {
                XmlNode::Attribute => open.attrs.get(&mapping.param).cloned(),
                XmlNode::Element { path } => extract_child_text(&open.content, path),
                XmlNode::Text => Some(open.content.trim().to_owned()),
                XmlNode::Content => Some(open.content.clone()),
            };

            match raw {
                Some(raw) => match coerce_xml_value(mapping.value_type, &raw) {
                    Ok(value) => {
                        arguments.insert(mapping.param.clone(), value);
                    }
                    Err(e) => {
                        return Some(ParserEvent::Synthetic(ToolResult {
                            call_id,
                            tool_name: open.spec.name.clone(),
                            success: false,
                            payload: Value::Null,
                            error: Some(format!("parameter {:?}: {e}", mapping.param)),
                        }));
                    }
                },
                None if mapping.required => {
                    return Some(ParserEvent::Synthetic(ToolResult {
                        call_id,
                        tool_name: open.spec.name.clone(),
                        success: false,
                        payload: Value::Null,
                        error: Some(format!("missing required parameter: {}", mapping.param)),
                    }));
                }
                None => {}
            }
        }

        self.xml_calls_emitted += 1;
        Some(ParserEvent::Call(ToolCall::xml(call_id, &open.spec.name, Value::Object(arguments))))
    }

    fn next_call_id(&mut self, tag: &str) -> String {
        let ordinal = self.ordinals.entry(tag.to_owned()).or_insert(0);
        let id = format!("xml-{tag}-{ordinal}");
        *ordinal += 1;
        id
    }
}

/// Length of the longest buffer suffix that is a proper prefix of
/// `needle` — the bytes that must be withheld because the closing marker
/// may be split across chunks.
fn partial_suffix_len(buffer: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        if buffer.is_char_boundary(buffer.len() - len) && needle.starts_with(&buffer[buffer.len() - len..]) {
            return len;
        }
    }
    0
}

/// Text of the first child element addressed by a `"./child"` path.
fn extract_child_text(content: &str, path: &str) -> Option<String> {
    let child = path.strip_prefix("./").unwrap_or(path);
    let open = format!("<{child}>");
    let close = format!("</{child}>");
    let start = content.find(&open)? + open.len();
    let end = content[start..].find(&close)? + start;
    Some(content[start..end].to_owned())
}
