//! Crate-wide error kind, modelled after the closed `Error` enums the
//! teacher firmware uses for its flash and wire-protocol status codes.

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A flash `program_word`/`erase_sector` call reported a hardware
    /// status error (`PGAERR|PGPERR|PGSERR|WRPERR`). Fatal.
    FlashProgramFailed = 1,
    /// A value read back from flash after a program did not match what
    /// was written (only the committer distinguishes this from a plain
    /// hardware status failure; both are fatal).
    FlashVerifyFailed = 2,
    /// The stored mnemonic plaintext failed the BIP-0039 wordlist check
    /// at the point of use. Fatal: the record is corrupt.
    StorageCorrupt = 3,
    /// Read magic does not match `MAGIC`. Not fatal by itself: callers
    /// treat this identically to "no storage" and trigger `wipe`.
    MagicMismatch = 4,
    /// Read version is greater than `STORAGE_VERSION`. Same handling as
    /// `MagicMismatch`.
    DowngradeDetected = 5,
    /// A secure-chip driver call returned a non-success status. Never
    /// fatal: the in-progress operation reverts.
    SecureChipFailure = 6,
    /// `protect_passphrase` (or any other UI prompt) was cancelled.
    UserCancel = 7,
    /// An address/length pair did not fall within a configured flash
    /// area, or a buffer exceeded its fixed capacity.
    InvalidArgument = 8,
    /// No mnemonic is present so a seed cannot be derived.
    NoMnemonic = 9,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// True for errors which §7 classifies as non-recoverable: the
    /// caller must invoke the UI's diverging `fatal()` and never return.
    ///
    /// `StorageCore`'s flash-touching methods (`commit`, `from_flash`,
    /// `increase_pin_fails`, `next_u2f_counter`, ...) run below any
    /// particular UI handle — they are shared by call sites that do and
    /// don't have one to hand — so they report these errors as ordinary
    /// `Result`s rather than diverging internally. An integrator is
    /// expected to check `is_fatal()` on every `Result` it gets back from
    /// `StorageCore` and route a `true` into its own `UiProgress::fatal`,
    /// the same way `pipeline::get_seed` does internally for a failed
    /// mnemonic checksum, the one fatal condition this crate detects deep
    /// enough inside a UI-bearing call to act on directly.
    pub fn is_fatal(self) -> bool {
        matches!(self, Error::FlashProgramFailed | Error::FlashVerifyFailed | Error::StorageCorrupt)
    }
}
