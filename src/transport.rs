//! Session transport contract and fetch window arithmetic
//!
//! [`MailTransport`] opens sessions and [`MailSession`] drives one of them
//! through select, search, fetch and close. The IMAP implementation lives in
//! [`crate::imap`]; the retrieval orchestrator only depends on these traits.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use futures::stream::BoxStream;

use crate::errors::{AppError, AppResult};

/// Mailbox state captured when a folder is selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderHandle {
    /// Folder name as sent to the server
    pub name: String,
    /// Total messages in the folder at selection time
    pub total: u32,
}

/// One message body delivered by a fetch
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub seq: u32,
    pub body: Vec<u8>,
}

/// Inclusive sequence-number interval `[lo, hi]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    lo: u32,
    hi: u32,
}

impl FetchRange {
    /// Build a range, rejecting `lo == 0` and `lo > hi`
    pub fn new(lo: u32, hi: u32) -> Option<Self> {
        (lo >= 1 && lo <= hi).then_some(Self { lo, hi })
    }

    /// Newest `count` messages of a folder holding `total` messages
    ///
    /// Yields `[max(1, total - count + 1), total]`, or `None` when either
    /// side is zero.
    pub fn window(total: u32, count: u32) -> Option<Self> {
        if total == 0 || count == 0 {
            return None;
        }
        let lo = total.saturating_sub(count).saturating_add(1);
        Self::new(lo, total)
    }

    pub fn lo(&self) -> u32 {
        self.lo
    }

    pub fn hi(&self) -> u32 {
        self.hi
    }

    pub fn len(&self) -> u32 {
        self.hi - self.lo + 1
    }
}

impl fmt::Display for FetchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}:{}", self.lo, self.hi)
        }
    }
}

/// Ordered list of fetch ranges, rendered in IMAP sequence-set syntax
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: Vec<FetchRange>,
}

impl SequenceSet {
    pub fn from_range(range: FetchRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    /// Collapse sequence numbers into contiguous ranges
    ///
    /// Input order and duplicates do not matter.
    pub fn from_seqs(seqs: &[u32]) -> Self {
        let mut sorted: Vec<u32> = seqs.iter().copied().filter(|s| *s > 0).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut ranges: Vec<FetchRange> = Vec::new();
        for seq in sorted {
            match ranges.last_mut() {
                Some(last) if last.hi + 1 == seq => last.hi = seq,
                _ => ranges.push(FetchRange { lo: seq, hi: seq }),
            }
        }
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of sequence numbers covered
    pub fn count(&self) -> u32 {
        self.ranges.iter().map(FetchRange::len).sum()
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.ranges.iter().any(|r| r.lo() <= seq && seq <= r.hi())
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, range) in self.ranges.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

/// Which message population the `read_emails` window is sized against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowBasis {
    /// Newest `N` of the messages matched by the unseen search
    #[default]
    Unseen,
    /// Newest `N` messages of the folder, read or not
    Folder,
}

impl WindowBasis {
    /// Compute the sequence set to fetch
    ///
    /// `unseen` are the search matches; `count` is the requested window size.
    pub fn sequence_set(self, folder: &FolderHandle, unseen: &[u32], count: u32) -> SequenceSet {
        match self {
            Self::Folder => FetchRange::window(folder.total, count)
                .map(SequenceSet::from_range)
                .unwrap_or_default(),
            Self::Unseen => {
                let mut matches = unseen.to_vec();
                matches.sort_unstable();
                matches.dedup();
                let keep = usize::try_from(count).unwrap_or(usize::MAX).min(matches.len());
                SequenceSet::from_seqs(&matches[matches.len() - keep..])
            }
        }
    }
}

impl FromStr for WindowBasis {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unseen" => Ok(Self::Unseen),
            "folder" => Ok(Self::Folder),
            other => Err(AppError::invalid(format!(
                "unknown window basis '{other}', expected 'unseen' or 'folder'"
            ))),
        }
    }
}

/// Opens sessions against a remote message store
pub trait MailTransport: Send + Sync {
    type Session: MailSession;

    /// Connect and authenticate
    fn open(&self) -> impl Future<Output = AppResult<Self::Session>> + Send;
}

/// One live, exclusively owned mailbox session
pub trait MailSession: Send {
    /// Select a folder; the name is upper-cased before lookup
    fn select_folder(
        &mut self,
        folder: &str,
    ) -> impl Future<Output = AppResult<FolderHandle>> + Send;

    /// Sequence numbers of messages without the `\Seen` flag
    fn search_unseen(&mut self) -> impl Future<Output = AppResult<Vec<u32>>> + Send;

    /// Start fetching full bodies; messages arrive as the server sends them
    fn fetch(
        &mut self,
        set: SequenceSet,
    ) -> impl Future<Output = AppResult<BoxStream<'_, AppResult<FetchedMessage>>>> + Send;

    /// End the session; failures are logged, never returned
    fn close(self) -> impl Future<Output = ()> + Send;
}
