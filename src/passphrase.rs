//! Passphrase reading functionality

use crate::error::{ErrorCategory, ErrorKind, QuicryptError, Result};
use std::collections::VecDeque;
use std::io::{self, IsTerminal, Read, Write};
use std::num::NonZeroU32;
use zeroize::Zeroizing;

/// What the passphrase is being asked for.
///
/// Readers that talk to a human use this to pick the prompt text; the
/// decrypt attempt number is carried here rather than in reader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    /// First entry of a new passphrase.
    Encrypt,
    /// Confirmation of a new passphrase.
    Confirm,
    /// Passphrase for decryption; `attempt` starts at 1.
    Decrypt { attempt: u32 },
}

impl Prompt {
    pub fn text(self) -> &'static str {
        match self {
            Prompt::Encrypt => "Enter password to encrypt: ",
            Prompt::Confirm => "Re-Enter password: ",
            Prompt::Decrypt { attempt } if attempt <= 1 => "decrypt password: ",
            Prompt::Decrypt { .. } => "incorrect. decrypt password: ",
        }
    }
}

/// How many decryption passphrases to try before giving up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<NonZeroU32>,
}

impl RetryPolicy {
    /// Keep asking until the passphrase is right.
    pub const fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    pub const fn bounded(max_attempts: NonZeroU32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    /// A single attempt; used whenever the passphrase source cannot change
    /// its answer.
    pub const fn once() -> Self {
        Self::bounded(NonZeroU32::MIN)
    }

    pub fn max_attempts(&self) -> Option<NonZeroU32> {
        self.max_attempts
    }

    /// Whether attempt number `attempt` (1-based) may be made.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_attempts {
            None => true,
            Some(max) => attempt <= max.get(),
        }
    }
}

/// Trait for reading passphrases from various sources
pub trait PassphraseReader {
    /// Read a passphrase as arbitrary bytes (not necessarily UTF-8)
    ///
    /// Returns the passphrase wrapped in `Zeroizing` to ensure it is securely
    /// wiped from memory when dropped.
    fn read_passphrase(&mut self, prompt: Prompt) -> Result<Zeroizing<Vec<u8>>>;
}

/// Returns a fixed passphrase (for testing)
pub struct ConstantPassphraseReader {
    passphrase: Zeroizing<Vec<u8>>,
}

impl ConstantPassphraseReader {
    pub fn new(passphrase: Vec<u8>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase),
        }
    }
}

impl PassphraseReader for ConstantPassphraseReader {
    fn read_passphrase(&mut self, _prompt: Prompt) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new((*self.passphrase).clone()))
    }
}

/// Hands out a fixed sequence of passphrases, one per prompt, and records
/// the prompts it was asked with. Fails once the sequence is used up.
pub struct SequencePassphraseReader {
    answers: VecDeque<Zeroizing<Vec<u8>>>,
    prompts: Vec<Prompt>,
}

impl SequencePassphraseReader {
    pub fn new<I, P>(answers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            answers: answers
                .into_iter()
                .map(|p| Zeroizing::new(p.into()))
                .collect(),
            prompts: Vec::new(),
        }
    }

    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }
}

impl PassphraseReader for SequencePassphraseReader {
    fn read_passphrase(&mut self, prompt: Prompt) -> Result<Zeroizing<Vec<u8>>> {
        self.prompts.push(prompt);
        self.answers.pop_front().ok_or_else(|| {
            QuicryptError::new(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "no more passphrases available",
            )
        })
    }
}

/// Reads passphrase from any io::Read source
pub struct ReaderPassphraseReader {
    reader: Box<dyn Read>,
}

impl ReaderPassphraseReader {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self { reader }
    }
}

impl PassphraseReader for ReaderPassphraseReader {
    fn read_passphrase(&mut self, _prompt: Prompt) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = Zeroizing::new(Vec::new());
        self.reader.read_to_end(&mut data).map_err(|e| {
            QuicryptError::with_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("error reading passphrase: {}", e),
                e,
            )
        })?;
        Ok(data)
    }
}

/// Reads passphrase from terminal with no echo
pub struct TerminalPassphraseReader;

impl TerminalPassphraseReader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TerminalPassphraseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PassphraseReader for TerminalPassphraseReader {
    /// Read passphrase from terminal.
    ///
    /// Note: Terminal input is limited to UTF-8 due to rpassword library constraints.
    /// For non-UTF-8 passphrases, use --passphrase-stdin instead.
    fn read_passphrase(&mut self, prompt: Prompt) -> Result<Zeroizing<Vec<u8>>> {
        if !io::stdin().is_terminal() {
            return Err(QuicryptError::new(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "cannot read passphrase from terminal - stdin is not a terminal",
            ));
        }

        let mut stderr = io::stderr();
        stderr
            .write_all(prompt.text().as_bytes())
            .and_then(|()| stderr.flush())
            .map_err(|e| {
                QuicryptError::with_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    format!("failed to write prompt: {}", e),
                    e,
                )
            })?;

        // Read password *without echo*
        // Note: rpassword returns String (UTF-8 only), not zeroized
        let passphrase = rpassword::read_password().map_err(|e| {
            QuicryptError::with_source(
                ErrorCategory::Internal,
                ErrorKind::PassphraseUnavailable,
                format!("failure reading passphrase: {}", e),
                e,
            )
        })?;

        Ok(Zeroizing::new(passphrase.into_bytes()))
    }
}

/// Wraps another PassphraseReader and caches the result
///
/// Provides "at most once" semantics - the upstream reader is called
/// only on the first invocation, and subsequent calls return the cached value.
/// This is what lets a passphrase piped on stdin satisfy both the entry and
/// the confirmation prompt.
pub struct CachingPassphraseReader {
    upstream: Box<dyn PassphraseReader>,
    cached: Option<Zeroizing<Vec<u8>>>,
}

impl CachingPassphraseReader {
    pub fn new(upstream: Box<dyn PassphraseReader>) -> Self {
        Self {
            upstream,
            cached: None,
        }
    }
}

impl PassphraseReader for CachingPassphraseReader {
    fn read_passphrase(&mut self, prompt: Prompt) -> Result<Zeroizing<Vec<u8>>> {
        let cached = match self.cached.take() {
            Some(cached) => cached,
            None => self.upstream.read_passphrase(prompt)?,
        };
        let copy = Zeroizing::new((*cached).clone());
        self.cached = Some(cached);
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_reader() {
        let mut reader = ConstantPassphraseReader::new(b"test123".to_vec());
        assert_eq!(&*reader.read_passphrase(Prompt::Encrypt).unwrap(), b"test123");
        assert_eq!(&*reader.read_passphrase(Prompt::Confirm).unwrap(), b"test123");
    }

    /// Tests the terminal reader. This is ignored by default and must be run
    /// explicitly and with human input:
    ///
    /// cargo test test_terminal_reader_interactive -- --ignored --nocapture
    #[test]
    #[ignore]
    fn test_terminal_reader_interactive() {
        let mut reader = TerminalPassphraseReader::new();
        println!("\nPlease enter a test passphrase:");
        let passphrase = reader.read_passphrase(Prompt::Encrypt).unwrap();
        println!("You entered: {}", String::from_utf8_lossy(&passphrase));
        assert!(!passphrase.is_empty(), "Expected non-empty passphrase");
    }

    #[test]
    fn test_reader_passphrase_reader() {
        let data = b"mypassword";
        let mut reader = ReaderPassphraseReader::new(Box::new(&data[..]));
        assert_eq!(&*reader.read_passphrase(Prompt::Encrypt).unwrap(), b"mypassword");
    }

    /// Verifies that ReaderPassphraseReader accepts arbitrary byte sequences,
    /// not just valid UTF-8.
    #[test]
    fn test_reader_passphrase_reader_non_utf8() {
        let data: &[u8] = &[0xff, 0xfe, 0x00, 0x01];
        let mut reader = ReaderPassphraseReader::new(Box::new(data));
        assert_eq!(&*reader.read_passphrase(Prompt::Encrypt).unwrap(), data);
    }

    #[test]
    fn test_caching_reader() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct CountingReader {
            passphrase: Vec<u8>,
            call_count: Rc<RefCell<usize>>,
        }

        impl PassphraseReader for CountingReader {
            fn read_passphrase(&mut self, _prompt: Prompt) -> Result<Zeroizing<Vec<u8>>> {
                *self.call_count.borrow_mut() += 1;
                Ok(Zeroizing::new(self.passphrase.clone()))
            }
        }

        let call_count = Rc::new(RefCell::new(0));
        let upstream = CountingReader {
            passphrase: b"cached_pass".to_vec(),
            call_count: call_count.clone(),
        };

        let mut caching = CachingPassphraseReader::new(Box::new(upstream));

        assert_eq!(&*caching.read_passphrase(Prompt::Encrypt).unwrap(), b"cached_pass");
        assert_eq!(*call_count.borrow(), 1);

        assert_eq!(&*caching.read_passphrase(Prompt::Confirm).unwrap(), b"cached_pass");
        assert_eq!(*call_count.borrow(), 1);
    }

    #[test]
    fn test_caching_reader_with_error() {
        struct FailingReader;

        impl PassphraseReader for FailingReader {
            fn read_passphrase(&mut self, _prompt: Prompt) -> Result<Zeroizing<Vec<u8>>> {
                Err(QuicryptError::new(
                    ErrorCategory::Internal,
                    ErrorKind::PassphraseUnavailable,
                    "simulated error",
                ))
            }
        }

        let mut caching = CachingPassphraseReader::new(Box::new(FailingReader));

        // Errors are not cached; the upstream is asked again.
        assert!(caching.read_passphrase(Prompt::Encrypt).is_err());
        assert!(caching.read_passphrase(Prompt::Encrypt).is_err());
    }

    #[test]
    fn test_sequence_reader() {
        let mut reader = SequencePassphraseReader::new(["first", "second"]);
        assert_eq!(&*reader.read_passphrase(Prompt::Encrypt).unwrap(), b"first");
        assert_eq!(&*reader.read_passphrase(Prompt::Confirm).unwrap(), b"second");
        let err = reader
            .read_passphrase(Prompt::Decrypt { attempt: 1 })
            .expect_err("expected exhaustion");
        assert_eq!(err.kind, ErrorKind::PassphraseUnavailable);
        assert_eq!(
            reader.prompts(),
            [Prompt::Encrypt, Prompt::Confirm, Prompt::Decrypt { attempt: 1 }]
        );
    }

    #[test]
    fn test_prompt_text() {
        assert_eq!(Prompt::Encrypt.text(), "Enter password to encrypt: ");
        assert_eq!(Prompt::Confirm.text(), "Re-Enter password: ");
        assert_eq!(Prompt::Decrypt { attempt: 1 }.text(), "decrypt password: ");
        assert_eq!(
            Prompt::Decrypt { attempt: 4 }.text(),
            "incorrect. decrypt password: "
        );
    }

    #[test]
    fn test_retry_policy() {
        assert!(RetryPolicy::unbounded().allows(u32::MAX));
        assert!(RetryPolicy::once().allows(1));
        assert!(!RetryPolicy::once().allows(2));

        let three = RetryPolicy::bounded(NonZeroU32::new(3).unwrap());
        assert!(three.allows(3));
        assert!(!three.allows(4));
        assert_eq!(three.max_attempts(), NonZeroU32::new(3));
        assert_eq!(RetryPolicy::once().max_attempts(), Some(NonZeroU32::MIN));
        assert_eq!(RetryPolicy::default(), RetryPolicy::unbounded());
        assert_eq!(RetryPolicy::unbounded().max_attempts(), None);
    }
}
