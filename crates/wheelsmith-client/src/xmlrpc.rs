//! A minimal XML-RPC envelope: just enough of the protocol to speak the
//! PyPI change-log API (ints, strings, nils and nested arrays).

use std::fmt::Write;

use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum XmlRpcError {
    #[error("malformed XML-RPC payload: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed XML-RPC payload: {0}")]
    Structure(String),
    #[error("XML-RPC fault: {0}")]
    Fault(String),
}

/// The value universe the PyPI change log uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Int(i64),
    Str(String),
    Array(Vec<Value>),
    Nil,
}

impl Value {
    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }
}

/// Render a `methodCall` document.
pub(crate) fn request(method: &str, params: &[Value]) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\"?>\n<methodCall>");
    let _ = write!(body, "<methodName>{method}</methodName><params>");
    for param in params {
        body.push_str("<param>");
        write_value(&mut body, param);
        body.push_str("</param>");
    }
    body.push_str("</params></methodCall>");
    body
}

fn write_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(int) => {
            let _ = write!(out, "<int>{int}</int>");
        }
        Value::Str(string) => {
            let mut escaped = String::new();
            for char in string.chars() {
                match char {
                    '<' => escaped.push_str("&lt;"),
                    '>' => escaped.push_str("&gt;"),
                    '&' => escaped.push_str("&amp;"),
                    other => escaped.push(other),
                }
            }
            let _ = write!(out, "<string>{escaped}</string>");
        }
        Value::Array(values) => {
            out.push_str("<array><data>");
            for value in values {
                write_value(out, value);
            }
            out.push_str("</data></array>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>");
}

/// Parse a `methodResponse` document into its single result value.
pub(crate) fn parse_response(body: &str) -> Result<Value, XmlRpcError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut in_fault = false;
    loop {
        match reader.read_event()? {
            Event::Start(tag) => match tag.name().as_ref() {
                b"fault" => in_fault = true,
                b"value" => {
                    let value = parse_value(&mut reader)?;
                    if in_fault {
                        return Err(XmlRpcError::Fault(format!("{value:?}")));
                    }
                    return Ok(value);
                }
                _ => {}
            },
            Event::Eof => {
                return Err(XmlRpcError::Structure(
                    "response carries no value".to_string(),
                ));
            }
            _ => {}
        }
    }
}

/// Parse the contents of a `<value>` element; the reader has just consumed
/// the opening tag.
fn parse_value(reader: &mut Reader<&[u8]>) -> Result<Value, XmlRpcError> {
    let mut value = None;
    loop {
        match reader.read_event()? {
            Event::Start(tag) => match tag.name().as_ref() {
                b"int" | b"i4" | b"i8" => {
                    let text = read_text(reader)?;
                    let int = text.trim().parse::<i64>().map_err(|_| {
                        XmlRpcError::Structure(format!("`{text}` is not an integer"))
                    })?;
                    value = Some(Value::Int(int));
                }
                b"boolean" => {
                    let text = read_text(reader)?;
                    value = Some(Value::Int(i64::from(text.trim() == "1")));
                }
                b"string" => {
                    value = Some(Value::Str(read_text(reader)?));
                }
                b"array" => {
                    value = Some(parse_array(reader)?);
                }
                b"nil" => {
                    value = Some(Value::Nil);
                }
                other => {
                    return Err(XmlRpcError::Structure(format!(
                        "unsupported XML-RPC type `{}`",
                        String::from_utf8_lossy(other),
                    )));
                }
            },
            Event::Empty(tag) if tag.name().as_ref() == b"nil" => {
                value = Some(Value::Nil);
            }
            // A bare text node inside <value> is an implicit string.
            Event::Text(text) if value.is_none() => {
                value = Some(Value::Str(text.unescape().map_err(quick_xml::Error::from)?.into_owned()));
            }
            Event::End(tag) if tag.name().as_ref() == b"value" => {
                return Ok(value.unwrap_or(Value::Str(String::new())));
            }
            Event::Eof => {
                return Err(XmlRpcError::Structure("unterminated value".to_string()));
            }
            _ => {}
        }
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> Result<Value, XmlRpcError> {
    let mut values = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(tag) if tag.name().as_ref() == b"value" => {
                values.push(parse_value(reader)?);
            }
            Event::End(tag) if tag.name().as_ref() == b"array" => {
                return Ok(Value::Array(values));
            }
            Event::Eof => {
                return Err(XmlRpcError::Structure("unterminated array".to_string()));
            }
            _ => {}
        }
    }
}

fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, XmlRpcError> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(chunk) => text.push_str(&chunk.unescape().map_err(quick_xml::Error::from)?),
            Event::End(_) => return Ok(text),
            Event::Eof => {
                return Err(XmlRpcError::Structure("unterminated scalar".to_string()));
            }
            _ => {}
        }
    }
}
