//! Document-to-Markdown conversion.
//!
//! Dispatch is by declared content type first, then by the file extension
//! found in the content-disposition `filename` parameter:
//!
//! - JSON is pretty-printed and wrapped in a ` ```json ` fence.
//! - Plain text is wrapped as-is in a ` ```text ` fence.
//! - HTML, DOCX and ODT go through `pandoc`; PDF goes through `pdftotext`.
//! - `.md` files pass through untouched.
//!
//! External converters stream stdin→stdout under a 30 second wall-clock
//! limit; stderr is captured and surfaced on failure.

use bytes::Bytes;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Wall-clock limit for external conversion subprocesses.
const CONVERT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while converting a document to Markdown.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Neither the content type nor the filename extension is convertible.
    #[error("unsupported file: content type '{content_type}', filename {filename:?}")]
    Unsupported {
        /// Declared content type of the upload.
        content_type: String,
        /// Filename taken from the content disposition, if any.
        filename: Option<String>,
    },
    /// A JSON document failed to parse.
    #[error("invalid JSON document: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// An external converter exited unsuccessfully.
    #[error("{tool} failed: {detail}")]
    Subprocess {
        /// Converter binary name.
        tool: &'static str,
        /// Exit status and captured stderr.
        detail: String,
    },
    /// An external converter exceeded the wall-clock limit.
    #[error("{tool} timed out after {CONVERT_TIMEOUT:?}")]
    Timeout {
        /// Converter binary name.
        tool: &'static str,
    },
    /// Spawning or talking to the converter process failed.
    #[error("converter io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert uploaded bytes to Markdown based on content type and filename.
pub async fn to_markdown(
    data: Bytes,
    content_type: &str,
    content_disposition: &str,
) -> Result<Bytes, ConvertError> {
    // Parameters such as charset are irrelevant for dispatch.
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match media_type.as_str() {
        "application/json" => {
            tracing::debug!("Content detected as JSON");
            return json_to_markdown(&data);
        }
        "text/plain" => {
            tracing::debug!("Content detected as plain text");
            return Ok(fence("text", &data));
        }
        "text/html" => {
            tracing::debug!("Content detected as HTML");
            return pandoc(data, "html").await;
        }
        "application/pdf" => {
            tracing::debug!("Content detected as PDF");
            return pdftotext(data).await;
        }
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            tracing::debug!("Content detected as DOCX");
            return pandoc(data, "docx").await;
        }
        "application/vnd.oasis.opendocument.text" => {
            tracing::debug!("Content detected as ODT");
            return pandoc(data, "odt").await;
        }
        _ => {}
    }

    let filename = disposition_filename(content_disposition);
    let extension = filename
        .as_deref()
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()));

    match extension.as_deref() {
        Some("md") => {
            tracing::debug!("Content detected as Markdown from extension");
            Ok(data)
        }
        Some("txt" | "text") => {
            tracing::debug!("Content detected as plain text from extension");
            Ok(fence("text", &data))
        }
        Some("json") => {
            tracing::debug!("Content detected as JSON from extension");
            json_to_markdown(&data)
        }
        Some("odt") => pandoc(data, "odt").await,
        Some("docx") => pandoc(data, "docx").await,
        Some("pdf") => pdftotext(data).await,
        _ => Err(ConvertError::Unsupported {
            content_type: media_type,
            filename,
        }),
    }
}

/// Extract the `filename` parameter from a content-disposition header.
fn disposition_filename(content_disposition: &str) -> Option<String> {
    content_disposition.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    })
}

fn fence(language: &str, data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(data.len() + language.len() + 8);
    out.extend_from_slice(b"```");
    out.extend_from_slice(language.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(data);
    out.extend_from_slice(b"\n```");
    Bytes::from(out)
}

fn json_to_markdown(data: &[u8]) -> Result<Bytes, ConvertError> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    let pretty = serde_json::to_string_pretty(&value)?;
    Ok(fence("json", pretty.as_bytes()))
}

async fn pandoc(data: Bytes, from_format: &'static str) -> Result<Bytes, ConvertError> {
    run_converter(
        "pandoc",
        &["--from", from_format, "--to", "markdown"],
        data,
    )
    .await
}

async fn pdftotext(data: Bytes) -> Result<Bytes, ConvertError> {
    // `-` `-` reads the PDF from stdin and writes text to stdout.
    run_converter("pdftotext", &["-", "-"], data).await
}

async fn run_converter(
    tool: &'static str,
    args: &[&str],
    data: Bytes,
) -> Result<Bytes, ConvertError> {
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child.stdin.take().ok_or_else(|| {
        std::io::Error::other(format!("failed to open stdin pipe to {tool}"))
    })?;
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&data).await;
        // Dropping stdin closes the pipe so the converter sees EOF.
    });

    let output = match tokio::time::timeout(CONVERT_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            writer.abort();
            return Err(ConvertError::Timeout { tool });
        }
    };
    let _ = writer.await;

    if !output.status.success() {
        return Err(ConvertError::Subprocess {
            tool,
            detail: format!(
                "{}, stderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(Bytes::from(output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wraps_plain_text_in_fence() {
        let md = to_markdown(Bytes::from_static(b"hello world"), "text/plain", "")
            .await
            .unwrap();
        assert_eq!(&md[..], b"```text\nhello world\n```");
    }

    #[tokio::test]
    async fn pretty_prints_json() {
        let md = to_markdown(
            Bytes::from_static(br#"{"b":1,"a":[2]}"#),
            "application/json",
            "",
        )
        .await
        .unwrap();
        let text = String::from_utf8(md.to_vec()).unwrap();
        assert!(text.starts_with("```json\n"));
        assert!(text.ends_with("\n```"));
        assert!(text.contains("  \"a\": [\n"));
    }

    #[tokio::test]
    async fn rejects_invalid_json() {
        let err = to_markdown(Bytes::from_static(b"{nope"), "application/json", "")
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidJson(_)));
    }

    #[tokio::test]
    async fn markdown_extension_passes_through() {
        let md = to_markdown(
            Bytes::from_static(b"# Title"),
            "application/octet-stream",
            r#"attachment; filename="notes.md""#,
        )
        .await
        .unwrap();
        assert_eq!(&md[..], b"# Title");
    }

    #[tokio::test]
    async fn charset_parameter_is_ignored() {
        let md = to_markdown(
            Bytes::from_static(b"plain"),
            "text/plain; charset=utf-8",
            "",
        )
        .await
        .unwrap();
        assert_eq!(&md[..], b"```text\nplain\n```");
    }

    #[tokio::test]
    async fn unknown_type_is_unsupported() {
        let err = to_markdown(
            Bytes::from_static(b"GIF89a"),
            "image/gif",
            r#"attachment; filename="pic.gif""#,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConvertError::Unsupported { .. }));
    }

    #[test]
    fn extracts_disposition_filename() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="report.pdf""#),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            disposition_filename("inline; filename=plain.txt"),
            Some("plain.txt".to_string())
        );
        assert_eq!(disposition_filename("attachment"), None);
    }
}
