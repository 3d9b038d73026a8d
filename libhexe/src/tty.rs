// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local terminal plumbing: winsize ioctls, the resize frame payload,
//! and the raw-mode guard used while attached to a pod.

use std::os::unix::io::RawFd;

use anyhow::Context;
use byteorder::{BigEndian, ByteOrder};
use nix::{
    sys::termios::{self, SetArg},
    unistd::isatty,
};
use tracing::error;

const STDIN_FD: RawFd = 0;
const STDOUT_FD: RawFd = 1;
const STDERR_FD: RawFd = 2;

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    /// from_fd returns the terminal size for the given terminal.
    pub fn from_fd(fd: RawFd) -> anyhow::Result<Size> {
        let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };

        // Safety: term_size is stack allocated and live for the whole
        //         call.
        unsafe {
            tiocgwinsz(fd, &mut term_size).context("fetching term size")?;
        }

        Ok(Size { rows: term_size.ws_row, cols: term_size.ws_col })
    }

    /// set_fd sets the tty indicated by the given file descriptor
    /// to have this size.
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let term_size =
            libc::winsize { ws_row: self.rows, ws_col: self.cols, ws_xpixel: 0, ws_ypixel: 0 };

        // Safety: term_size is stack allocated and live for the whole
        //         call.
        unsafe {
            tiocswinsz(fd, &term_size).context("setting term size")?;
        }

        Ok(())
    }

    /// The resize frame payload: `{cols u16 BE, rows u16 BE}`.
    pub fn to_frame_payload(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        BigEndian::write_u16(&mut buf[..2], self.cols);
        BigEndian::write_u16(&mut buf[2..], self.rows);
        buf
    }

    pub fn from_frame_payload(data: &[u8]) -> Option<Size> {
        if data.len() < 4 {
            return None;
        }
        Some(Size { cols: BigEndian::read_u16(&data[..2]), rows: BigEndian::read_u16(&data[2..4]) })
    }
}

/// Holds the local tty in raw mode for as long as it lives. While
/// attached, every keystroke must reach the pod's pty unmolested; that
/// pty owns echo, signals, and line editing, so the local side gets
/// `cfmakeraw` treatment and nothing more. Dropping the guard puts the
/// saved settings back, including on early returns and panics.
pub struct AttachFlagsGuard {
    saved: Option<termios::Termios>,
}

impl AttachFlagsGuard {
    /// Switch stdin to raw mode. When any stdio stream is not a
    /// terminal (tests, pipes) this is a no-op guard, so non-interactive
    /// attaches work unchanged.
    pub fn acquire() -> anyhow::Result<AttachFlagsGuard> {
        if !isatty(STDIN_FD)? || !isatty(STDOUT_FD)? || !isatty(STDERR_FD)? {
            return Ok(AttachFlagsGuard { saved: None });
        }

        let saved = termios::tcgetattr(STDIN_FD).context("grabbing term flags")?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(STDIN_FD, SetArg::TCSANOW, &raw).context("setting raw mode")?;

        Ok(AttachFlagsGuard { saved: Some(saved) })
    }
}

impl std::ops::Drop for AttachFlagsGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = termios::tcsetattr(STDIN_FD, SetArg::TCSANOW, &saved) {
                error!("error restoring terminal settings: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resize_payload_round_trip() {
        let size = Size { rows: 24, cols: 80 };
        let payload = size.to_frame_payload();
        assert_eq!(payload, [0x00, 0x50, 0x00, 0x18]);
        assert_eq!(Size::from_frame_payload(&payload), Some(size));
        assert_eq!(Size::from_frame_payload(&payload[..3]), None);
    }

    #[test]
    fn guard_is_inert_without_a_tty() {
        let interactive = isatty(STDIN_FD).unwrap_or(false)
            && isatty(STDOUT_FD).unwrap_or(false)
            && isatty(STDERR_FD).unwrap_or(false);
        if interactive {
            // can't assert inertness while actually on a terminal
            return;
        }
        // piped runs must not error and must leave nothing to restore
        let guard = AttachFlagsGuard::acquire().expect("acquire to succeed");
        assert!(guard.saved.is_none());
        drop(guard);
    }
}
