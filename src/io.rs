//! Positioned file I/O helpers.
//!
//! Thin loops over the platform positioned-read/write primitives; a short
//! read is an error here because every caller reads whole pages.

use std::fs::File;
use std::io::{self, ErrorKind};

/// Reads exactly `dst.len()` bytes at `off`, failing on EOF.
pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    while !dst.is_empty() {
        let read = read_at(file, dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "positioned read reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

/// Writes all of `src` at `off`, retrying partial writes.
pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    while !src.is_empty() {
        let written = write_at(file, src, off)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "positioned write made no progress",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(dst, off)
}

#[cfg(unix)]
fn write_at(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(src, off)
}

#[cfg(windows)]
fn read_at(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(dst, off)
}

#[cfg(windows)]
fn write_at(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(src, off)
}
