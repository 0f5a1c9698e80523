use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ScanError;

/// Default ceiling on the number of addresses one template may expand to.
pub const DEFAULT_MAX_ADDRESSES: u64 = 5_000_000;

static RANGE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)-(\d+)\]").expect("static regex"));

/// True when `template` contains at least one well-formed `[n-m]` token.
///
/// Bracketed IPv6 hosts such as `udp://[ff02::1]:5000` are not tokens.
pub fn has_range(template: &str) -> bool {
    RANGE_TOKEN.is_match(template)
}

/// Parse `template` and return its lazy batch sequence.
pub fn expand(template: &str, batch_size: usize) -> Result<Batches, ScanError> {
    Ok(AddressTemplate::parse(template)?.batches(batch_size))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RangeToken {
    text: String,
    start: u64,
    end: u64,
    /// Zero-pad width; 0 means no padding.
    width: usize,
}

impl RangeToken {
    fn render(&self, value: u64, out: &mut String) {
        use std::fmt::Write;
        let _ = write!(out, "{:0width$}", value, width = self.width);
    }

    fn span(&self) -> u128 {
        u128::from(self.end - self.start) + 1
    }
}

/// A parsed address template: literal segments interleaved with range tokens.
///
/// `segments.len() == tokens.len() + 1` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTemplate {
    raw: String,
    segments: Vec<String>,
    tokens: Vec<RangeToken>,
}

impl AddressTemplate {
    pub fn parse(template: &str) -> Result<Self, ScanError> {
        Self::parse_with_limit(template, DEFAULT_MAX_ADDRESSES)
    }

    pub fn parse_with_limit(template: &str, max_addresses: u64) -> Result<Self, ScanError> {
        let mut segments = Vec::new();
        let mut tokens = Vec::new();
        let mut last = 0usize;

        for caps in RANGE_TOKEN.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            let (a, b) = (&caps[1], &caps[2]);
            let text = whole.as_str().to_string();

            let start = parse_bound(a, &text)?;
            let end = parse_bound(b, &text)?;
            if start > end {
                return Err(ScanError::RangeSyntax {
                    token: text,
                    reason: format!("start {start} is greater than end {end}"),
                });
            }
            let padded = has_leading_zero(a) || has_leading_zero(b);
            let width = if padded { a.len().max(b.len()) } else { 0 };

            segments.push(template[last..whole.start()].to_string());
            tokens.push(RangeToken {
                text,
                start,
                end,
                width,
            });
            last = whole.end();
        }
        segments.push(template[last..].to_string());

        let parsed = Self {
            raw: template.to_string(),
            segments,
            tokens,
        };
        let count = parsed.address_count();
        if count > u128::from(max_addresses) {
            return Err(ScanError::MaxRangeExceeded {
                count,
                limit: max_addresses,
            });
        }
        Ok(parsed)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_range(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Number of addresses the template expands to.
    pub fn address_count(&self) -> u128 {
        self.tokens
            .iter()
            .try_fold(1u128, |acc, t| acc.checked_mul(t.span()))
            .unwrap_or(u128::MAX)
    }

    /// A fresh lazy batch sequence starting from the first address.
    pub fn batches(&self, batch_size: usize) -> Batches {
        Batches {
            current: self.tokens.iter().map(|t| t.start).collect(),
            template: self.clone(),
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }

    fn render(&self, values: &[u64]) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for (segment, (token, value)) in self.segments.iter().zip(self.tokens.iter().zip(values)) {
            out.push_str(segment);
            token.render(*value, &mut out);
        }
        if let Some(tail) = self.segments.last() {
            out.push_str(tail);
        }
        out
    }
}

/// Lazy iterator over address batches. Only one batch is held in memory.
#[derive(Debug, Clone)]
pub struct Batches {
    template: AddressTemplate,
    current: Vec<u64>,
    batch_size: usize,
    exhausted: bool,
}

impl Batches {
    /// Advance the odometer; rightmost token varies fastest.
    fn step(&mut self) -> bool {
        for i in (0..self.current.len()).rev() {
            let token = &self.template.tokens[i];
            if self.current[i] < token.end {
                self.current[i] += 1;
                for (j, t) in self.template.tokens.iter().enumerate().skip(i + 1) {
                    self.current[j] = t.start;
                }
                return true;
            }
        }
        false
    }
}

impl Iterator for Batches {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if !self.template.has_range() {
            self.exhausted = true;
            return Some(vec![self.template.raw.clone()]);
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            batch.push(self.template.render(&self.current));
            if !self.step() {
                self.exhausted = true;
                break;
            }
        }
        Some(batch)
    }
}

fn has_leading_zero(literal: &str) -> bool {
    literal.len() > 1 && literal.starts_with('0')
}

fn parse_bound(literal: &str, token: &str) -> Result<u64, ScanError> {
    literal.parse::<u64>().map_err(|e| ScanError::RangeSyntax {
        token: token.to_string(),
        reason: format!("bound {literal} is not a valid number: {e}"),
    })
}
