//! Just enough multipart/form-data and urlencoded parsing to pull routing fields out of uploads.

use bytes::Bytes;

#[derive(Debug, Clone)]
pub(crate) struct FormPart {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) data: Bytes,
}

impl FormPart {
    pub(crate) fn text(&self) -> Option<&str> {
        if self.filename.is_some() {
            return None;
        }
        std::str::from_utf8(&self.data).ok().map(str::trim)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() || start >= haystack.len() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|rel| start + rel)
}

fn boundary(content_type: &str) -> Result<&str, String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if !key.trim().eq_ignore_ascii_case("boundary") {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            (!value.is_empty()).then_some(value)
        })
        .ok_or_else(|| "multipart boundary is missing".to_string())
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn skip_line_break(bytes: &[u8], cursor: usize) -> usize {
    if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
        cursor + 2
    } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
        cursor + 1
    } else {
        cursor
    }
}

pub(crate) fn parse_form_parts(content_type: &str, body: &Bytes) -> Result<Vec<FormPart>, String> {
    let marker = format!("--{}", boundary(content_type)?);
    let delimiter = format!("\r\n{marker}");
    let bytes = body.as_ref();

    let Some(start) = find_subslice(bytes, marker.as_bytes(), 0) else {
        return Err("multipart body missing boundary marker".to_string());
    };
    let mut cursor = start + marker.len();
    let mut parts = Vec::new();

    while bytes.get(cursor..cursor + 2) != Some(b"--") {
        cursor = skip_line_break(bytes, cursor);
        let (headers_end, data_start) = match find_subslice(bytes, b"\r\n\r\n", cursor) {
            Some(idx) => (idx, idx + 4),
            None => match find_subslice(bytes, b"\n\n", cursor) {
                Some(idx) => (idx, idx + 2),
                None => return Err("multipart part missing header separator".to_string()),
            },
        };

        let headers = String::from_utf8_lossy(&bytes[cursor..headers_end]);
        let mut name = None;
        let mut filename = None;
        for line in headers.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("content-disposition") {
                continue;
            }
            for item in value.split(';').map(str::trim) {
                if let Some(value) = item.strip_prefix("name=") {
                    name = Some(unquote(value).to_string());
                } else if let Some(value) = item.strip_prefix("filename=") {
                    filename = Some(unquote(value).to_string());
                }
            }
        }
        let name = name.ok_or_else(|| "multipart part missing field name".to_string())?;

        let Some(data_end) = find_subslice(bytes, delimiter.as_bytes(), data_start) else {
            return Err("multipart part missing trailing boundary".to_string());
        };
        parts.push(FormPart {
            name,
            filename,
            data: body.slice(data_start..data_end),
        });
        cursor = data_end + delimiter.len();
    }

    Ok(parts)
}

/// First non-file multipart field named `field`.
pub(crate) fn multipart_field(
    content_type: &str,
    body: &Bytes,
    field: &str,
) -> Result<Option<String>, String> {
    let parts = parse_form_parts(content_type, body)?;
    Ok(parts
        .iter()
        .filter(|part| part.name == field)
        .find_map(|part| part.text().map(str::to_string)))
}

/// First `field` in an `application/x-www-form-urlencoded` body.
pub(crate) fn urlencoded_field(body: &[u8], field: &str) -> Option<String> {
    let raw = std::str::from_utf8(body).ok()?;
    raw.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (percent_decode(key) == field).then(|| percent_decode(value))
    })
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match raw
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                Some(byte) => {
                    out.push(byte);
                    i += 2;
                }
                None => out.push(b'%'),
            },
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> (String, Bytes) {
        let body = concat!(
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\n",
            "Content-Type: audio/wav\r\n\r\n",
            "RIFF....\r\n",
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"model\"\r\n\r\n",
            "whisper-large\r\n",
            "--XyZ--\r\n",
        );
        (
            "multipart/form-data; boundary=\"XyZ\"".to_string(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[test]
    fn model_field_is_found_after_file_part() {
        let (ct, body) = upload();
        assert_eq!(
            multipart_field(&ct, &body, "model").expect("parse"),
            Some("whisper-large".to_string())
        );
        assert_eq!(multipart_field(&ct, &body, "prompt").expect("parse"), None);
        assert_eq!(multipart_field(&ct, &body, "file").expect("parse"), None);
    }

    #[test]
    fn missing_boundary_is_an_error() {
        let (_, body) = upload();
        assert!(multipart_field("multipart/form-data", &body, "model").is_err());
    }

    #[test]
    fn urlencoded_fields_are_decoded() {
        assert_eq!(
            urlencoded_field(b"prompt=a+cat&model=gpt%2Dimage-1", "model"),
            Some("gpt-image-1".to_string())
        );
        assert_eq!(urlencoded_field(b"prompt=x", "model"), None);
    }
}
