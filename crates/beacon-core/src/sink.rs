use crate::trace::Capture;

/// Seam for the writer's local-persistence step: append-only JSONL plus the
/// `ENDPOINT_CAPTURE:`-prefixed stdout line. Kept abstract so writer tests
/// can assert against an in-memory fake instead of a real file; exactly one
/// production implementation exists (the binary crate's file-backed sink).
pub trait TraceSink: Send + Sync {
    fn record(&self, capture: &Capture) -> std::io::Result<()>;
}
