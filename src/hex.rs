// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for error context.

use pretty_hex::PrettyHex;

/// Wraps a byte slice so its `Debug` form is a hex dump of at most
/// `max_bytes` bytes, noting how much was omitted.
pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (shown, omitted) = if self.inner.len() > self.max_bytes {
            (
                &self.inner[..self.max_bytes],
                self.inner.len() - self.max_bytes,
            )
        } else {
            (self.inner, 0)
        };
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        writeln!(
            f,
            "{:#?}",
            shown.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if omitted > 0 {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", omitted)?;
        }
        Ok(())
    }
}
