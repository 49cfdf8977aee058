//! Resync after a provider disconnect.
//!
//! Compares the characters submitted during a failed attempt against the
//! characters the provider confirmed as spoken, and returns the suffix that
//! still has to be synthesized.

use tracing::{debug, error, info, warn};

use voxflow_core::error::{Result, VoxflowError};

/// Maximum index offset between the expected and actual confirmed position.
pub const DISPLACEMENT_TOLERANCE: usize = 2;

const CONTEXT_RADIUS: usize = 10;

/// Map a submitted character to the form the provider reports it in.
fn normalize(ch: char) -> String {
    let mapped = match ch {
        '\u{2018}' | '\u{2019}' => "'",
        '\u{201C}' | '\u{201D}' => "\"",
        '\u{2013}' | '\u{2014}' => "-",
        '\u{2026}' => "...",
        '\u{2022}' => "*",
        '\u{00A3}' => "GBP",
        '\u{20AC}' => "EUR",
        '\u{00D7}' => "x",
        '\u{00F7}' => "/",
        other => return other.to_string(),
    };
    mapped.to_string()
}

fn context<T>(items: &[T], center: usize) -> &[T] {
    let start = center.saturating_sub(CONTEXT_RADIUS).min(items.len());
    let end = center.saturating_add(CONTEXT_RADIUS).min(items.len());
    &items[start..end]
}

/// Find the first character of `sent` the provider has not voiced.
///
/// `confirmed` is the raw alignment stream of one attempt, still carrying the
/// leading glyph produced by the priming frame. Whitespace at the resume point
/// is never voiced, so the point moves past it. Returns `None` when nothing
/// voiceable remains.
pub fn resume_point(sent: &[char], confirmed: &[String]) -> Result<Option<usize>> {
    Ok(scan(sent, confirmed)?.and_then(|i| {
        sent[i..]
            .iter()
            .position(|c| !c.is_whitespace())
            .map(|offset| i + offset)
    }))
}

fn scan(sent: &[char], confirmed: &[String]) -> Result<Option<usize>> {
    let confirmed = confirmed.get(1..).unwrap_or_default();
    let normalized: Vec<String> = sent.iter().copied().map(normalize).collect();

    debug!(
        sent = sent.len(),
        confirmed = confirmed.len(),
        "Computing resume point"
    );

    let mut j = 0;
    for (i, ch) in normalized.iter().enumerate() {
        if ch == "\n" {
            continue;
        }

        if j >= confirmed.len() {
            info!(resume_point = i, "Reached end of confirmed characters");
            return Ok(Some(i));
        }

        let Some(offset) = confirmed[j..].iter().position(|c| c == ch) else {
            warn!(ch = %ch, position = i, "No confirmed match for character");
            debug!(
                sent = ?context(&normalized, i),
                confirmed = ?context(confirmed, j),
                "Alignment context"
            );
            return Ok(Some(i));
        };

        let found = j + offset;
        if offset > DISPLACEMENT_TOLERANCE {
            error!(
                ch = %ch,
                expected = j,
                found,
                tolerance = DISPLACEMENT_TOLERANCE,
                "Confirmed character outside displacement tolerance"
            );
            error!(sent = ?context(&normalized, i), "Context for sent characters");
            error!(
                at_expected = ?context(confirmed, j),
                at_found = ?context(confirmed, found),
                "Context for confirmed characters"
            );
            return Err(VoxflowError::Alignment {
                ch: ch.clone(),
                expected: j,
                found,
                tolerance: DISPLACEMENT_TOLERANCE,
            });
        }

        if offset > 0 {
            warn!(ch = %ch, expected = j, found, "Alignment idiosyncrasy");
            debug!(
                sent = ?context(&normalized, i),
                confirmed = ?context(confirmed, j),
                "Alignment context"
            );
        }
        j = found + 1;
    }

    info!("All submitted characters confirmed");
    Ok(None)
}

/// The unvoiced suffix of `sent`, in its original (non-normalized) form.
pub fn compute_residual(sent: &[char], confirmed: &[String]) -> Result<String> {
    let residual: String = match resume_point(sent, confirmed)? {
        Some(i) => sent[i..].iter().collect(),
        None => String::new(),
    };
    debug!(residual = ?residual, "Residual text");
    Ok(residual)
}
