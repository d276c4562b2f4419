use std::io::Write;
use tracing_subscriber::fmt::MakeWriter;

/// Substrings that mark the value following them as secret.
const SECRET_MARKERS: [&str; 8] = [
    "appkey",
    "appsecret",
    "app_key",
    "app_secret",
    "access_token",
    "authorization",
    "bot_token",
    "password",
];

/// Redact secret values from a log line. Applied to every sink: after a
/// recognized marker, the following `key=value` / `key: value` / `"key":
/// "value"` payload is replaced.
pub fn mask_secrets(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let lower = line.to_lowercase();
    let mut cursor = 0;

    while cursor < line.len() {
        // Find the nearest marker at or after the cursor.
        let next = SECRET_MARKERS
            .iter()
            .filter_map(|marker| lower[cursor..].find(marker).map(|i| (cursor + i, marker.len())))
            .min();

        let Some((start, marker_len)) = next else {
            out.push_str(&line[cursor..]);
            break;
        };

        // Copy through the marker itself.
        let value_scan = start + marker_len;
        out.push_str(&line[cursor..value_scan]);

        // Skip separators, then consume the secret value.
        let rest = &line[value_scan..];
        let sep_len = rest
            .char_indices()
            .take_while(|(_, c)| matches!(c, '"' | '\'' | ':' | '=' | ' '))
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        out.push_str(&rest[..sep_len]);

        let value = &rest[sep_len..];
        let mut value_len = value
            .char_indices()
            .take_while(|(_, c)| !matches!(c, '"' | '\'' | ' ' | ',' | '}' | '\n'))
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        // `Bearer <token>` carries the secret in the second word.
        if value[..value_len].eq_ignore_ascii_case("bearer") {
            let tail = &value[value_len..];
            let extra = tail
                .char_indices()
                .take_while(|(i, c)| *i == 0 && *c == ' ' || !matches!(c, '"' | '\'' | ' ' | ',' | '}' | '\n'))
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            value_len += extra;
        }
        if value_len > 0 {
            out.push_str("***");
        }
        cursor = value_scan + sep_len + value_len;
    }
    out
}

/// Writer wrapper applying `mask_secrets` line by line.
pub struct MaskingWriter<W: Write> {
    inner: W,
}

impl<W: Write> Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let masked = mask_secrets(&text);
        self.inner.write_all(masked.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// MakeWriter factory for tracing-subscriber layers.
#[derive(Clone, Default)]
pub struct MaskingStdout;

impl<'a> MakeWriter<'a> for MaskingStdout {
    type Writer = MaskingWriter<std::io::Stdout>;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter {
            inner: std::io::stdout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_kv_pairs() {
        let masked = mask_secrets("connecting appkey=PSA0x93k2 to broker");
        assert!(!masked.contains("PSA0x93k2"));
        assert!(masked.contains("appkey=***"));
    }

    #[test]
    fn test_masks_json_fields() {
        let masked = mask_secrets(r#"{"appsecret": "deadbeef22", "code": "005930"}"#);
        assert!(!masked.contains("deadbeef22"));
        assert!(masked.contains("005930"));
    }

    #[test]
    fn test_masks_bearer_header() {
        let masked = mask_secrets("authorization: Bearer eyJhbGciOi");
        assert!(!masked.contains("eyJhbGciOi"));
    }

    #[test]
    fn test_plain_lines_untouched() {
        let line = "batch 7 completed with 5 candidates";
        assert_eq!(mask_secrets(line), line);
    }

    #[test]
    fn test_multiple_secrets_one_line() {
        let masked = mask_secrets("app_key=aaa app_secret=bbb");
        assert!(!masked.contains("aaa"));
        assert!(!masked.contains("bbb"));
    }
}
