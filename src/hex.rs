// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps via `pretty-hex`, so a log line about a bad frame
//! can't balloon to the size of the frame itself.

use pretty_hex::PrettyHex;

pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = &self.inner[..self.inner.len().min(self.max_bytes)];
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        write!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(omitted) = self.inner.len().checked_sub(self.max_bytes) {
            if omitted > 0 {
                write!(f, "\n...{0} (0x{0:x}) bytes not shown...", omitted)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_input() {
        let data = [0u8; 100];
        let s = format!("{:?}", LimitedHex::new(&data, 16));
        assert!(s.starts_with("Length: 100 (0x64) bytes"));
        assert!(s.ends_with("...84 (0x54) bytes not shown..."));
    }

    #[test]
    fn short_input_unchanged() {
        let data = [1u8, 2, 3];
        let s = format!("{:?}", LimitedHex::new(&data, 16));
        assert!(!s.contains("not shown"));
    }
}
