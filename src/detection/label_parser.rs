/// Best-effort extraction of detections from a backend response body.
///
/// The body is not contractually structured: it is usually the repr of a
/// Python dict, so the parser looks for a `labels` marker, takes the first
/// bracketed range after it and reads that range as a list literal.
/// Anything that prevents locating or reading the list is reported as
/// `MalformedOutput`; individual bad entries are skipped with a warning.
use serde_json::{Map, Number, Value};

use crate::detection::types::Detection;
use crate::errors::MalformedOutput;

const LABELS_FIELD: &str = "labels";

#[derive(Debug, Clone, PartialEq)]
pub struct LabelWarning {
    /// Position of the skipped entry inside the labels list.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLabels {
    pub detections: Vec<Detection>,
    pub warnings: Vec<LabelWarning>,
}

pub fn parse(raw: &str) -> Result<ParsedLabels, MalformedOutput> {
    let after_marker = find_marker(raw, LABELS_FIELD).ok_or(MalformedOutput::MissingMarker)?;
    let (open, close) = locate_array(raw, after_marker)?;

    let mut parser = LiteralParser::new(&raw[open..=close]);
    let value = parser
        .parse_document()
        .map_err(|(offset, reason)| MalformedOutput::InvalidLiteral {
            offset: open + offset,
            reason,
        })?;
    let Value::Array(items) = value else {
        return Err(MalformedOutput::InvalidLiteral {
            offset: open,
            reason: "labels value is not a list".into(),
        });
    };

    let mut parsed = ParsedLabels::default();
    for (index, item) in items.iter().enumerate() {
        match to_detection(item) {
            Ok(detection) => parsed.detections.push(detection),
            Err(reason) => {
                tracing::warn!(index, reason = %reason, "skipping label entry");
                parsed.warnings.push(LabelWarning { index, reason });
            }
        }
    }

    tracing::debug!(
        detections = parsed.detections.len(),
        skipped = parsed.warnings.len(),
        "labels parsed"
    );
    Ok(parsed)
}

/// Reads the quoted string value that follows a `'field':` marker.
pub fn extract_string_field(raw: &str, field: &str) -> Option<String> {
    let after_marker = find_marker(raw, field)?;
    let rest = raw[after_marker..].trim_start().strip_prefix(':')?;
    let mut parser = LiteralParser::new(rest);
    parser.skip_ws();
    match parser.peek() {
        Some(b'\'') | Some(b'"') => parser.parse_string().ok(),
        _ => None,
    }
}

/// Byte offset just past the earliest quoted occurrence of `field`.
fn find_marker(raw: &str, field: &str) -> Option<usize> {
    let single = format!("'{field}'");
    let double = format!("\"{field}\"");
    [single, double]
        .iter()
        .filter_map(|m| raw.find(m.as_str()).map(|at| at + m.len()))
        .min()
}

/// Returns the byte offsets of the first `[` after `from` and its matching `]`.
fn locate_array(raw: &str, from: usize) -> Result<(usize, usize), MalformedOutput> {
    let bytes = raw.as_bytes();
    let open = raw[from..]
        .find('[')
        .map(|rel| from + rel)
        .ok_or(MalformedOutput::MissingArray)?;

    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((open, i));
                }
            }
            _ => {}
        }
    }

    Err(MalformedOutput::UnterminatedArray(open))
}

fn to_detection(item: &Value) -> Result<Detection, String> {
    let obj = item.as_object().ok_or("entry is not an object")?;

    let class_name = obj
        .get("class")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("missing or non-string 'class'")?
        .to_string();

    let center_x = coordinate(obj, "cx")?;
    let center_y = coordinate(obj, "cy")?;
    let width = coordinate(obj, "width")?;
    let height = coordinate(obj, "height")?;

    for (name, v) in [("cx", center_x), ("cy", center_y)] {
        if !(0.0..=1.0).contains(&v) {
            return Err(format!("'{name}' = {v} is outside [0, 1]"));
        }
    }
    for (name, v) in [("width", width), ("height", height)] {
        if v <= 0.0 || v > 1.0 {
            return Err(format!("'{name}' = {v} is outside (0, 1]"));
        }
    }

    Ok(Detection {
        class_name,
        center_x,
        center_y,
        width,
        height,
    })
}

fn coordinate(obj: &Map<String, Value>, field: &str) -> Result<f64, String> {
    let value = match obj.get(field) {
        None => return Err(format!("missing '{field}'")),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    value
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{field}' is not a finite number"))
}

type LiteralResult<T> = Result<T, (usize, String)>;

/// Recursive-descent reader for Python / JSON style literals.
struct LiteralParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn parse_document(&mut self) -> LiteralResult<Value> {
        self.skip_ws();
        let value = self.parse_value()?;
        self.skip_ws();
        if self.pos != self.src.len() {
            return Err(self.error("trailing characters after literal"));
        }
        Ok(value)
    }

    fn error(&self, reason: &str) -> (usize, String) {
        (self.pos, reason.to_string())
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> LiteralResult<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", b as char)))
        }
    }

    fn parse_value(&mut self) -> LiteralResult<Value> {
        match self.peek() {
            Some(b'[') => self.parse_sequence(b'[', b']'),
            Some(b'(') => self.parse_sequence(b'(', b')'),
            Some(b'{') => self.parse_dict(),
            Some(b'\'') | Some(b'"') => self.parse_string().map(Value::String),
            Some(b) if b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.') => self.parse_number(),
            Some(b) if b.is_ascii_alphabetic() => self.parse_ident(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_sequence(&mut self, open: u8, close: u8) -> LiteralResult<Value> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b) if b == close => {}
                _ => return Err(self.error("expected ',' or end of list")),
            }
        }
    }

    fn parse_dict(&mut self) -> LiteralResult<Value> {
        self.expect(b'{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(Value::Object(map));
            }
            let key = match self.parse_value()? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {}
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn parse_string(&mut self) -> LiteralResult<String> {
        let quote = self.peek().ok_or_else(|| self.error("expected string"))?;
        self.pos += 1;
        let mut out: Vec<u8> = Vec::new();
        loop {
            let b = self.peek().ok_or_else(|| self.error("unterminated string"))?;
            self.pos += 1;
            if b == quote {
                break;
            }
            if b != b'\\' {
                out.push(b);
                continue;
            }
            let esc = self.peek().ok_or_else(|| self.error("unterminated escape"))?;
            self.pos += 1;
            match esc {
                b'n' => out.push(b'\n'),
                b't' => out.push(b'\t'),
                b'r' => out.push(b'\r'),
                b'0' => out.push(0),
                b'u' => {
                    let ch = self.parse_hex_escape(4)?;
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
                b'x' => {
                    let ch = self.parse_hex_escape(2)?;
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
                other => out.push(other),
            }
        }
        String::from_utf8(out).map_err(|_| self.error("string is not valid UTF-8"))
    }

    fn parse_hex_escape(&mut self, digits: usize) -> LiteralResult<char> {
        let end = self.pos + digits;
        let hex = self
            .src
            .get(self.pos..end)
            .and_then(|h| std::str::from_utf8(h).ok())
            .ok_or_else(|| self.error("truncated escape"))?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| self.error("invalid hex escape"))?;
        self.pos = end;
        char::from_u32(code).ok_or_else(|| self.error("invalid code point"))
    }

    fn parse_number(&mut self) -> LiteralResult<Value> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b) if b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E' | b'_')
        ) {
            self.pos += 1;
        }
        let text: String = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid number"))?
            .replace('_', "");

        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        let float = text
            .parse::<f64>()
            .map_err(|_| (start, format!("invalid number '{text}'")))?;
        // Overflowing literals such as 1e999 have no JSON representation.
        Ok(Number::from_f64(float).map(Value::Number).unwrap_or(Value::Null))
    }

    fn parse_ident(&mut self) -> LiteralResult<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        match &self.src[start..self.pos] {
            b"True" | b"true" => Ok(Value::Bool(true)),
            b"False" | b"false" => Ok(Value::Bool(false)),
            b"None" | b"null" | b"nan" | b"inf" => Ok(Value::Null),
            _ => Err((start, "unknown identifier".into())),
        }
    }
}
