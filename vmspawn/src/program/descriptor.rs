//! Spawn target descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// A byte window into a program image.
///
/// On the wire this is one `u64`: offset in the high 32 bits, length in the
/// low 32 bits. A length of zero means "up to the end of the image".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bounds {
    /// Start of the window.
    pub offset: u32,
    /// Window length, zero for the remainder of the image.
    pub length: u32,
}

impl Bounds {
    /// The whole image.
    pub const FULL: Self = Self {
        offset: 0,
        length: 0,
    };

    /// Creates a window.
    #[must_use]
    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    /// Decodes the packed wire form.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            offset: (raw >> 32) as u32,
            length: raw as u32,
        }
    }

    /// Encodes the packed wire form.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.offset as u64) << 32) | self.length as u64
    }

    /// Resolves the window against an image of `image_size` bytes.
    pub fn within(self, image_size: u64) -> Result<Range<u64>, String> {
        let start = u64::from(self.offset);
        let end = if self.length == 0 {
            image_size
        } else {
            start + u64::from(self.length)
        };
        if start > image_size || end > image_size {
            return Err(format!(
                "bounds {start}..{end} exceed image size {image_size}"
            ));
        }
        Ok(start..end)
    }
}

/// Names the program a spawn request should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    /// Index within the source.
    pub index: u64,
    /// Which collection the index refers to.
    pub source: u64,
    /// Window into the resolved image.
    #[serde(default)]
    pub bounds: Bounds,
}

impl ProgramDescriptor {
    /// Creates a descriptor covering the whole image.
    #[must_use]
    pub const fn new(index: u64, source: u64) -> Self {
        Self {
            index,
            source,
            bounds: Bounds::FULL,
        }
    }

    /// Sets the bounds.
    #[must_use]
    pub const fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }
}

impl fmt::Display for ProgramDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "program(index={}, source={:#x}, bounds={:#x})",
            self.index,
            self.source,
            self.bounds.to_raw()
        )
    }
}
