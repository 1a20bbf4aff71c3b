//! Mutation commands and their binary encoding.

use crate::error::{MergeTreeError, Result};
use crate::part::Row;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

const MAX_PREDICATE_DEPTH: usize = 64;

/// Row filter used by mutation commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowPredicate {
    /// Matches every row.
    All,
    /// `key = k`
    KeyEquals(u64),
    /// `start <= key < end`
    KeyRange {
        /// Inclusive lower bound.
        start: u64,
        /// Exclusive upper bound.
        end: u64,
    },
    /// `value < v`
    ValueLessThan(i64),
    /// `value > v`
    ValueGreaterThan(i64),
    /// `timestamp < t`
    TimestampBefore(i64),
    /// Negation.
    Not(Box<RowPredicate>),
    /// Conjunction.
    And(Box<RowPredicate>, Box<RowPredicate>),
    /// Disjunction.
    Or(Box<RowPredicate>, Box<RowPredicate>),
}

impl RowPredicate {
    /// Evaluates the predicate against a row.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::KeyEquals(key) => row.key == *key,
            Self::KeyRange { start, end } => row.key >= *start && row.key < *end,
            Self::ValueLessThan(v) => row.value < *v,
            Self::ValueGreaterThan(v) => row.value > *v,
            Self::TimestampBefore(t) => row.timestamp < *t,
            Self::Not(inner) => !inner.matches(row),
            Self::And(a, b) => a.matches(row) && b.matches(row),
            Self::Or(a, b) => a.matches(row) || b.matches(row),
        }
    }

    /// `self AND other`
    pub fn and(self, other: RowPredicate) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    pub fn or(self, other: RowPredicate) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// `NOT self`
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::All => buf.push(0),
            Self::KeyEquals(key) => {
                buf.push(1);
                buf.extend_from_slice(&key.to_le_bytes());
            }
            Self::KeyRange { start, end } => {
                buf.push(2);
                buf.extend_from_slice(&start.to_le_bytes());
                buf.extend_from_slice(&end.to_le_bytes());
            }
            Self::ValueLessThan(v) => {
                buf.push(3);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Self::ValueGreaterThan(v) => {
                buf.push(4);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Self::TimestampBefore(t) => {
                buf.push(5);
                buf.extend_from_slice(&t.to_le_bytes());
            }
            Self::Not(inner) => {
                buf.push(6);
                inner.encode(buf);
            }
            Self::And(a, b) => {
                buf.push(7);
                a.encode(buf);
                b.encode(buf);
            }
            Self::Or(a, b) => {
                buf.push(8);
                a.encode(buf);
                b.encode(buf);
            }
        }
    }

    fn decode(reader: &mut Reader<'_>, depth: usize) -> Result<Self> {
        if depth > MAX_PREDICATE_DEPTH {
            return Err(MergeTreeError::LogCorrupted(
                "predicate nesting too deep".to_string(),
            ));
        }
        let predicate = match reader.u8()? {
            0 => Self::All,
            1 => Self::KeyEquals(reader.u64()?),
            2 => Self::KeyRange {
                start: reader.u64()?,
                end: reader.u64()?,
            },
            3 => Self::ValueLessThan(reader.i64()?),
            4 => Self::ValueGreaterThan(reader.i64()?),
            5 => Self::TimestampBefore(reader.i64()?),
            6 => Self::Not(Box::new(Self::decode(reader, depth + 1)?)),
            7 => Self::And(
                Box::new(Self::decode(reader, depth + 1)?),
                Box::new(Self::decode(reader, depth + 1)?),
            ),
            8 => Self::Or(
                Box::new(Self::decode(reader, depth + 1)?),
                Box::new(Self::decode(reader, depth + 1)?),
            ),
            tag => {
                return Err(MergeTreeError::LogCorrupted(format!(
                    "unknown predicate tag {}",
                    tag
                )))
            }
        };
        Ok(predicate)
    }
}

impl fmt::Display for RowPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("1"),
            Self::KeyEquals(key) => write!(f, "key = {}", key),
            Self::KeyRange { start, end } => write!(f, "key >= {} AND key < {}", start, end),
            Self::ValueLessThan(v) => write!(f, "value < {}", v),
            Self::ValueGreaterThan(v) => write!(f, "value > {}", v),
            Self::TimestampBefore(t) => write!(f, "timestamp < {}", t),
            Self::Not(inner) => write!(f, "NOT ({})", inner),
            Self::And(a, b) => write!(f, "({}) AND ({})", a, b),
            Self::Or(a, b) => write!(f, "({}) OR ({})", a, b),
        }
    }
}

/// New value computed by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// `value = v`
    Set(i64),
    /// `value = value + v`
    Add(i64),
    /// `value = value * v`
    Multiply(i64),
}

impl Assignment {
    fn apply(&self, value: i64) -> i64 {
        match self {
            Self::Set(v) => *v,
            Self::Add(v) => value.wrapping_add(*v),
            Self::Multiply(v) => value.wrapping_mul(*v),
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set(v) => write!(f, "value = {}", v),
            Self::Add(v) => write!(f, "value = value + {}", v),
            Self::Multiply(v) => write!(f, "value = value * {}", v),
        }
    }
}

/// One transformation carried by a mutation.
///
/// # Examples
/// ```rust,ignore
/// use alopex_mergetree::mutation::{Assignment, MutationCommand, RowPredicate};
///
/// let commands = vec![
///     MutationCommand::delete(RowPredicate::KeyEquals(42)),
///     MutationCommand::update(RowPredicate::ValueLessThan(0), Assignment::Set(0)),
/// ];
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationCommand {
    /// Removes matching rows.
    Delete {
        /// Rows to remove.
        predicate: RowPredicate,
    },
    /// Rewrites `value` of matching rows.
    Update {
        /// Rows to rewrite.
        predicate: RowPredicate,
        /// New value.
        assignment: Assignment,
    },
}

impl MutationCommand {
    /// `DELETE WHERE predicate`
    pub fn delete(predicate: RowPredicate) -> Self {
        Self::Delete { predicate }
    }

    /// `UPDATE assignment WHERE predicate`
    pub fn update(predicate: RowPredicate, assignment: Assignment) -> Self {
        Self::Update {
            predicate,
            assignment,
        }
    }

    /// Applies this command to rows in place.
    pub fn apply(&self, rows: &mut Vec<Row>) {
        match self {
            Self::Delete { predicate } => rows.retain(|row| !predicate.matches(row)),
            Self::Update {
                predicate,
                assignment,
            } => {
                for row in rows.iter_mut().filter(|row| predicate.matches(row)) {
                    row.value = assignment.apply(row.value);
                }
            }
        }
    }
}

impl fmt::Display for MutationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete { predicate } => write!(f, "DELETE WHERE {}", predicate),
            Self::Update {
                predicate,
                assignment,
            } => write!(f, "UPDATE {} WHERE {}", assignment, predicate),
        }
    }
}

/// Applies commands in order, checking `cancelled` before each one.
///
/// Returns `MergeTreeError::Cancelled` as soon as the flag is observed so the
/// caller can abandon its output without committing.
pub fn apply_commands(
    mut rows: Vec<Row>,
    commands: &[MutationCommand],
    cancelled: &AtomicBool,
) -> Result<Vec<Row>> {
    for command in commands {
        if cancelled.load(Ordering::Acquire) {
            return Err(MergeTreeError::Cancelled(format!(
                "mutation stopped before `{}`",
                command
            )));
        }
        command.apply(&mut rows);
    }
    Ok(rows)
}

/// Renders a command list the way `mutations_status` reports it.
pub fn summarize(commands: &[MutationCommand]) -> String {
    commands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Encodes a command list for the mutation log.
pub fn encode_commands(commands: &[MutationCommand], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(commands.len() as u32).to_le_bytes());
    for command in commands {
        match command {
            MutationCommand::Delete { predicate } => {
                buf.push(1);
                predicate.encode(buf);
            }
            MutationCommand::Update {
                predicate,
                assignment,
            } => {
                buf.push(2);
                predicate.encode(buf);
                let (tag, operand) = match assignment {
                    Assignment::Set(v) => (0u8, *v),
                    Assignment::Add(v) => (1, *v),
                    Assignment::Multiply(v) => (2, *v),
                };
                buf.push(tag);
                buf.extend_from_slice(&operand.to_le_bytes());
            }
        }
    }
}

/// Decodes a command list produced by [`encode_commands`].
pub fn decode_commands(reader: &mut Reader<'_>) -> Result<Vec<MutationCommand>> {
    let count = reader.u32()? as usize;
    let mut commands = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let command = match reader.u8()? {
            1 => MutationCommand::Delete {
                predicate: RowPredicate::decode(reader, 0)?,
            },
            2 => {
                let predicate = RowPredicate::decode(reader, 0)?;
                let tag = reader.u8()?;
                let operand = reader.i64()?;
                let assignment = match tag {
                    0 => Assignment::Set(operand),
                    1 => Assignment::Add(operand),
                    2 => Assignment::Multiply(operand),
                    tag => {
                        return Err(MergeTreeError::LogCorrupted(format!(
                            "unknown assignment tag {}",
                            tag
                        )))
                    }
                };
                MutationCommand::Update {
                    predicate,
                    assignment,
                }
            }
            tag => {
                return Err(MergeTreeError::LogCorrupted(format!(
                    "unknown command tag {}",
                    tag
                )))
            }
        };
        commands.push(command);
    }
    Ok(commands)
}

/// Little-endian cursor over a log record payload.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Wraps a byte slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Consumes `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(MergeTreeError::LogCorrupted(format!(
                "record truncated: need {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a `u8`.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian `i64`.
    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Reads a `u32`-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MergeTreeError::LogCorrupted(format!("invalid utf-8: {}", e)))
    }
}

/// Appends a `u32`-length-prefixed string.
pub fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}
