//! Message table and payload layout.
//!
//! Every check site owns one [`MessageSlot`]: its code is the slot's index in
//! the [`ErrorSchema`], and it owns a disjoint range of the payload vector.
//! The payload therefore has the same width on every control-flow path, and
//! the table is complete before any error is discharged.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::array::format_number;

use super::error::ErrorCategory;

/// Static description of one check site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSlot {
    pub category: ErrorCategory,
    /// Message template; `{}` and `{N}` refer to the payload values.
    pub template: String,
    /// Start of this slot's range in the payload vector.
    pub offset: usize,
    /// Number of payload values the slot captures.
    pub arity: usize,
}

impl MessageSlot {
    /// Render the message from a full payload row.
    pub fn render(&self, payload: &[f64]) -> String {
        let end = (self.offset + self.arity).min(payload.len());
        let start = self.offset.min(end);
        let args: Vec<String> = payload[start..end].iter().map(|&x| format_number(x)).collect();
        render_template(&self.template, &args)
    }
}

/// Ordered message table shared by everything one instrumentation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSchema {
    slots: Vec<MessageSlot>,
    width: usize,
}

impl ErrorSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slot and return its `(code, offset)`.
    pub fn push(&mut self, category: ErrorCategory, template: String, arity: usize) -> (u32, usize) {
        let code = self.slots.len() as u32;
        let offset = self.width;
        self.slots.push(MessageSlot {
            category,
            template,
            offset,
            arity,
        });
        self.width += arity;
        (code, offset)
    }

    /// Append another table; returns the `(base code, base offset)` its slots
    /// were relocated to.
    pub fn append(&mut self, inner: &[MessageSlot]) -> (u32, usize) {
        let base = self.slots.len() as u32;
        let offset = self.width;
        for slot in inner {
            self.slots.push(MessageSlot {
                offset: offset + slot.offset,
                ..slot.clone()
            });
        }
        let inner_width = inner.iter().map(|s| s.offset + s.arity).max().unwrap_or(0);
        self.width += inner_width;
        (base, offset)
    }

    pub fn slots(&self) -> &[MessageSlot] {
        &self.slots
    }

    pub fn slot(&self, code: u32) -> Option<&MessageSlot> {
        self.slots.get(code as usize)
    }

    /// Payload width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Distinct templates of `codes`, in the order given.
    pub fn templates(&self, codes: &[u32]) -> Vec<String> {
        let mut seen = HashSet::new();
        codes
            .iter()
            .filter_map(|&code| self.slot(code))
            .filter(|slot| seen.insert(slot.template.as_str()))
            .map(|slot| slot.template.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Fill `{}` (sequential) and `{N}` (positional) placeholders.
///
/// `{{` and `}}` produce literal braces. Placeholders without a matching
/// argument are left as written.
pub fn render_template(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_arg = 0;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == '}' {
                        closed = true;
                        break;
                    }
                    field.push(d);
                }
                let arg = if !closed {
                    None
                } else if field.is_empty() {
                    next_arg += 1;
                    args.get(next_arg - 1)
                } else {
                    field.parse::<usize>().ok().and_then(|i| args.get(i))
                };
                match arg {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(&field);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}
