//! Local JSON-lines harness around the in-memory broker.
//!
//! Seed lines become incoming messages: a tagged payload (`{"type":"bytes","data":[...]}`), a JSON string
//! (text), any other JSON value (json), or, when the line is not JSON at all, the raw line as text.
//! Published results are written back one per line in the same shapes.

use std::path::Path;

use anyhow::Context;
use pilot_core::MemoryBroker;
use pilot_model::Payload;
use tokio::io::AsyncWriteExt;

pub fn parse_line(line: &str) -> Option<Payload> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    if let Ok(tagged) = serde_json::from_str::<Payload>(line) {
        return Some(tagged);
    }
    Some(match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::String(s)) => Payload::Text(s),
        Ok(value) => Payload::Json(value),
        Err(_) => Payload::Text(line.to_string()),
    })
}

pub fn render(payload: &Payload) -> String {
    match payload {
        Payload::Text(s) => serde_json::Value::String(s.clone()).to_string(),
        Payload::Json(v) => v.to_string(),
        Payload::Bytes(_) => serde_json::to_string(payload).unwrap_or_default(),
    }
}

/// Enqueue every payload of a seed file; returns how many.
pub async fn load_seed(broker: &MemoryBroker, queue: &str, path: &Path) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let mut n = 0;
    for payload in raw.lines().filter_map(parse_line) {
        broker.enqueue(queue, payload);
        n += 1;
    }
    Ok(n)
}

/// Write results as JSON lines to `dest`, or stdout.
pub async fn write_results(payloads: &[Payload], dest: Option<&Path>) -> anyhow::Result<()> {
    let mut body = String::new();
    for p in payloads {
        body.push_str(&render(p));
        body.push('\n');
    }
    match dest {
        Some(path) => tokio::fs::write(path, body)
            .await
            .with_context(|| format!("writing results to {}", path.display())),
        None => {
            let mut out = tokio::io::stdout();
            out.write_all(body.as_bytes()).await?;
            out.flush().await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seed_line_shapes() {
        assert_eq!(parse_line(r#""foo""#), Some(Payload::from("foo")));
        assert_eq!(parse_line("plain words"), Some(Payload::from("plain words")));
        assert_eq!(parse_line(r#"{"n": 1}"#), Some(Payload::Json(json!({"n": 1}))));
        assert_eq!(
            parse_line(r#"{"type":"bytes","data":[1,2]}"#),
            Some(Payload::Bytes(vec![1, 2]))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn renders_results() {
        assert_eq!(render(&Payload::from("foofoo\n")), r#""foofoo\n""#);
        assert_eq!(render(&Payload::Json(json!([1]))), "[1]");
        assert_eq!(
            render(&Payload::Bytes(vec![7])),
            r#"{"type":"bytes","data":[7]}"#
        );
    }

    #[tokio::test]
    async fn seed_and_results_files() {
        let tmp = tempfile::tempdir().unwrap();
        let seed = tmp.path().join("seed.jsonl");
        tokio::fs::write(&seed, "\"foo\"\n\n\"bar\"\n").await.unwrap();

        let broker = MemoryBroker::new();
        assert_eq!(load_seed(&broker, "in", &seed).await.unwrap(), 2);
        assert_eq!(
            broker.payloads("in"),
            vec![Payload::from("foo"), Payload::from("bar")]
        );

        let out = tmp.path().join("results.jsonl");
        write_results(&broker.payloads("in"), Some(&out)).await.unwrap();
        let written = tokio::fs::read_to_string(&out).await.unwrap();
        assert_eq!(written, "\"foo\"\n\"bar\"\n");
    }
}
