//! Trace and span identifiers.
//!
//! Telemetry API records carry trace context in two shapes: the X-Ray header
//! on `platform.start` (`Root=1-…;Parent=…;Sampled=…`) and bare hex ids on
//! structured function logs. Both are turned into the raw byte ids OTLP uses.

/// A 16-byte trace id and 8-byte span id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    /// Trace id.
    pub trace_id: [u8; 16],
    /// Span id of the parent.
    pub span_id: [u8; 8],
    /// Whether the upstream sampler kept the trace.
    pub sampled: bool,
}

impl TraceContext {
    /// Extracts the trace context from an X-Ray trace header.
    ///
    /// Returns `None` unless the header has a version-1 `Root` and a
    /// 16-hex-digit `Parent`.
    ///
    /// ```
    /// use opentelemetry_lambda_collector::trace_context::TraceContext;
    ///
    /// let header = "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1";
    /// let ctx = TraceContext::from_xray(header).unwrap();
    /// assert_eq!(hex::encode(ctx.trace_id), "5759e988bd862e3fe1be46a994272793");
    /// assert!(ctx.sampled);
    /// ```
    pub fn from_xray(header: &str) -> Option<Self> {
        let mut root = None;
        let mut parent = None;
        let mut sampled = false;

        for (key, value) in header.split(';').filter_map(|p| p.trim().split_once('=')) {
            match key {
                "Root" => root = Some(value),
                "Parent" => parent = Some(value),
                "Sampled" => sampled = value == "1",
                _ => {}
            }
        }

        let mut parts = root?.split('-');
        let (version, epoch, random) = (parts.next()?, parts.next()?, parts.next()?);
        if version != "1" || parts.next().is_some() || epoch.len() != 8 || random.len() != 24 {
            return None;
        }

        Some(Self {
            trace_id: parse_trace_id(&format!("{epoch}{random}"))?,
            span_id: parse_span_id(parent?)?,
            sampled,
        })
    }
}

/// Parses a 32-hex-digit trace id.
pub fn parse_trace_id(value: &str) -> Option<[u8; 16]> {
    decode_fixed(value)
}

/// Parses a 16-hex-digit span id.
pub fn parse_span_id(value: &str) -> Option<[u8; 8]> {
    decode_fixed(value)
}

fn decode_fixed<const N: usize>(value: &str) -> Option<[u8; N]> {
    if value.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(value, &mut out).ok()?;
    Some(out)
}

/// Generates a random, non-zero trace id.
pub fn generate_trace_id() -> Vec<u8> {
    loop {
        let id = rand::random::<[u8; 16]>();
        if id != [0; 16] {
            return id.to_vec();
        }
    }
}

/// Generates a random, non-zero span id.
pub fn generate_span_id() -> Vec<u8> {
    loop {
        let id = rand::random::<[u8; 8]>();
        if id != [0; 8] {
            return id.to_vec();
        }
    }
}
