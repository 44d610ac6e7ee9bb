//! Renders a `serde_json::Value` argument/response tree to the AWS query
//! protocol's XML wire format, and builds the two error envelopes (EC2 and
//! Route 53) described in §6.
//!
//! AWS query responses can wrap list elements in one of two conventions:
//! *expanded* (every element is literally `<item>`) or *condensed* (every
//! element is named after the parent tag with its trailing `s` stripped,
//! e.g. `<Tags><Tag>...</Tag></Tags>`). `ListStyle` picks between them at
//! the point a `Value::Array` is serialized.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use serde_json::{Map, Value};
use std::io::Cursor;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStyle {
    Expanded,
    Condensed,
}

pub fn render_response(body: &Value, root: &str, xmlns: Option<&str>, style: ListStyle) -> String {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    let mut start = BytesStart::new(root);
    if let Some(ns) = xmlns {
        start.push_attribute(("xmlns", ns));
    }
    writer.write_event(Event::Start(start)).expect("in-memory writer");
    write_value(&mut writer, body, root, style);
    writer
        .write_event(Event::End(BytesEnd::new(root)))
        .expect("in-memory writer");

    let bytes = writer.into_inner().into_inner();
    let body_xml = String::from_utf8(bytes).expect("xml writer produces utf8");
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body_xml}")
}

/// Write the children of `value` (assumed to be a JSON object, the normal
/// shape of a handler's returned body) as sibling elements.
fn write_value(writer: &mut Writer<Cursor<Vec<u8>>>, value: &Value, parent_tag: &str, style: ListStyle) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                write_field(writer, key, child, style);
            }
        }
        Value::Array(items) => {
            for item in items {
                write_field(writer, &singularize(parent_tag), item, style);
            }
        }
        Value::Null => {}
        scalar => write_text_element(writer, parent_tag, scalar),
    }
}

fn write_field(writer: &mut Writer<Cursor<Vec<u8>>>, key: &str, value: &Value, style: ListStyle) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            writer
                .write_event(Event::Start(BytesStart::new(key)))
                .expect("in-memory writer");
            let item_tag = match style {
                ListStyle::Expanded => "item".to_string(),
                ListStyle::Condensed => singularize(key),
            };
            for item in items {
                write_field(writer, &item_tag, item, style);
            }
            writer
                .write_event(Event::End(BytesEnd::new(key)))
                .expect("in-memory writer");
        }
        Value::Object(_) => {
            writer
                .write_event(Event::Start(BytesStart::new(key)))
                .expect("in-memory writer");
            write_value(writer, value, key, style);
            writer
                .write_event(Event::End(BytesEnd::new(key)))
                .expect("in-memory writer");
        }
        scalar => write_text_element(writer, key, scalar),
    }
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, value: &Value) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("in-memory writer");
    let text = scalar_to_text(value);
    if !text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&text)))
            .expect("in-memory writer");
    }
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("in-memory writer");
}

fn scalar_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// "Condensed" list-element naming: strip one trailing `s` from the
/// parent/container tag. `Tags` -> `Tag`, `ResourceRecords` -> `ResourceRecord`.
fn singularize(tag: &str) -> String {
    if let Some(stripped) = tag.strip_suffix('s') {
        stripped.to_string()
    } else {
        tag.to_string()
    }
}

/// EC2 error envelope: `<Response><RequestID/><Errors><Error>...`
pub fn render_ec2_error(request_id: &str, code: &str, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n  <RequestID>{request_id}</RequestID>\n  <Errors>\n    <Error>\n      <Code>{code}</Code>\n      <Message>{message}</Message>\n      <Type>Sender</Type>\n    </Error>\n  </Errors>\n</Response>",
        request_id = escape(request_id),
        code = escape(code),
        message = escape(message),
    )
}

/// Route 53 error envelope: `<ErrorResponse><RequestId/><Error>...`
pub fn render_route53_error(request_id: &str, code: &str, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <ErrorResponse>\n  <RequestId>{request_id}</RequestId>\n  <Error>\n    <Code>{code}</Code>\n    <Message>{message}</Message>\n    <Type>Sender</Type>\n  </Error>\n</ErrorResponse>",
        request_id = escape(request_id),
        code = escape(code),
        message = escape(message),
    )
}

/// Decodes a request body's root element into the same flattened
/// argument tree the query-form decoder produces: repeated sibling
/// tags of the same name collapse into a `Value::Array`, a childless
/// element becomes its text content, everything else becomes a map.
/// The mirror image of [`render_response`]'s condensed list writing.
pub fn parse_request_body(xml: &str) -> ApiResult<Value> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(|e| ApiError::InvalidInput(e.to_string()))? {
            Event::Start(_) => return parse_element(&mut reader, &mut buf),
            Event::Empty(_) => return Ok(Value::Object(Map::new())),
            Event::Eof => return Err(ApiError::InvalidInput("empty request body".into())),
            _ => {}
        }
        buf.clear();
    }
}

fn parse_element(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> ApiResult<Value> {
    let mut children: Vec<(String, Value)> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(buf).map_err(|e| ApiError::InvalidInput(e.to_string()))? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                buf.clear();
                let value = parse_element(reader, buf)?;
                children.push((name, value));
            }
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                children.push((name, Value::String(String::new())));
            }
            Event::Text(t) => {
                text.push_str(&t.unescape().map_err(|e| ApiError::InvalidInput(e.to_string()))?);
            }
            Event::End(_) | Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if children.is_empty() {
        return Ok(Value::String(text));
    }

    let mut map = Map::new();
    for (name, value) in children {
        match map.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, value]);
            }
            None => {
                map.insert(name, value);
            }
        }
    }
    Ok(Value::Object(map))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
