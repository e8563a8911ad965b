//! Feeds: consumer callbacks attached to a dispatcher stream (spec §3, §9).

use std::sync::Arc;

use crate::error::Result;
use crate::segment::OutputSegment;

type LineFn = dyn Fn(Option<String>) -> Result<()> + Send + Sync;
type RawFn = dyn Fn(Option<OutputSegment>) -> Result<()> + Send + Sync;

/// A feed that receives decoded UTF-8 lines, terminated by one `None` (EOS).
#[derive(Clone)]
pub struct LineFeed(Arc<LineFn>);

impl LineFeed {
    pub fn new(f: impl Fn(Option<String>) -> Result<()> + Send + Sync + 'static) -> LineFeed {
        LineFeed(Arc::new(f))
    }

    pub(crate) fn call(&self, line: Option<String>) -> Result<()> {
        (self.0)(line)
    }

    fn ptr_eq(&self, other: &LineFeed) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A feed that receives opaque byte segments, terminated by one `None` (EOS).
#[derive(Clone)]
pub struct RawFeed(Arc<RawFn>);

impl RawFeed {
    pub fn new(f: impl Fn(Option<OutputSegment>) -> Result<()> + Send + Sync + 'static) -> RawFeed {
        RawFeed(Arc::new(f))
    }

    pub(crate) fn call(&self, data: Option<OutputSegment>) -> Result<()> {
        (self.0)(data)
    }

    fn ptr_eq(&self, other: &RawFeed) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The tagged set of things that can sit in a dispatcher's feed array: user
/// line/raw feeds, the at-most-one internal line scanner, and (only inside
/// the collector) an internal buffering feed. Kept as a sum type rather
/// than a trait-object hierarchy, per spec §9 design notes.
#[derive(Clone)]
pub enum Feed {
    Line(LineFeed),
    Raw(RawFeed),
}

impl Feed {
    pub(crate) fn ptr_eq(&self, other: &Feed) -> bool {
        match (self, other) {
            (Feed::Line(a), Feed::Line(b)) => a.ptr_eq(b),
            (Feed::Raw(a), Feed::Raw(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub(crate) fn is_line(&self) -> bool {
        matches!(self, Feed::Line(_))
    }
}
