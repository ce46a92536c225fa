use super::error::CoreError;

const NORM_EPSILON: f64 = 1e-12;

/// Cosine similarity of two embeddings, in `[-1.0, 1.0]`.
///
/// Accumulates in f64. Empty, mismatched, zero-norm or non-finite vectors
/// are reported as `EmbeddingUnavailable` so callers can apply their own
/// policy (see [`scored_similarity`]).
pub fn text_similarity(a: &[f32], b: &[f32]) -> Result<f64, CoreError> {
    if a.is_empty() || b.is_empty() {
        return Err(CoreError::EmbeddingUnavailable("empty embedding".to_string()));
    }
    if a.len() != b.len() {
        return Err(CoreError::EmbeddingUnavailable(format!(
            "dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if !(dot.is_finite() && norm_a.is_finite() && norm_b.is_finite()) {
        return Err(CoreError::EmbeddingUnavailable("non-finite component".to_string()));
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= NORM_EPSILON {
        return Err(CoreError::EmbeddingUnavailable("zero-norm embedding".to_string()));
    }

    Ok((dot / denom).clamp(-1.0, 1.0))
}

/// Similarity of two optional embeddings; `None` when either side is
/// missing or cannot be scored. Callers count `None` as 0.0 (dissimilar).
pub fn scored_similarity(a: Option<&[f32]>, b: Option<&[f32]>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => text_similarity(a, b).ok(),
        _ => None,
    }
}

/// Normalize a description before embedding: runs of non-word characters
/// become a single space, the result is trimmed and lowercased.
pub fn preprocess_description(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}
