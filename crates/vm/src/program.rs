//! Program module for the Erkao VM.
//!
//! A [`Program`] ties a compiled chunk tree back to the source buffer it
//! came from, which is what runtime diagnostics slice their two-line
//! context snippets out of. Programs are reference counted: every function
//! object and every running frame holds a strong reference, so a program is
//! released exactly when nothing compiled from it can run anymore.

use std::rc::Rc;

/// An owned compilation unit: the source text and the path it was read from.
#[derive(Debug)]
pub struct Program {
    /// Path the source was loaded from (or a synthetic name such as
    /// `<script>` for embedder-supplied buffers)
    pub path: String,
    /// The complete source text
    pub source: String,
}

impl Program {
    /// Creates a new reference-counted program.
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            path: path.into(),
            source: source.into(),
        })
    }
}
