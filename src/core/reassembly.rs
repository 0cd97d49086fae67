//! Reassembly of fragmented credential writes
//!
//! Two delivery modes share one bounded buffer:
//! - append: consecutive writes are concatenated and a [`FramingStrategy`]
//!   decides when the message is complete
//! - prepared: fragments carry explicit offsets and are applied in offset
//!   order when the peer commits the long write
//!
//! Only one transfer is in flight. Switching mode abandons the pending one.

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::core::{error::ProvisioningError, framing::FramingStrategy};

/// Maximum credential payload size in bytes
pub const CREDENTIAL_BUFFER_CAPACITY: usize = 512;

/// Upper bound on queued prepared-write fragments per transfer
pub const MAX_PREPARED_FRAGMENTS: usize = 64;

/// Identity of one transfer, used to key its expiry timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Append,
    Prepared,
}

/// Result of feeding one append-mode fragment
#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The framing strategy saw the end of the message; the buffer is reset
    Complete(Vec<u8>),
    /// More fragments expected
    Pending { transfer: TransferId, len: usize },
}

struct StagedFragment {
    offset: usize,
    bytes: Vec<u8>,
}

/// Bounded credential reassembly buffer
pub struct ReassemblyBuffer {
    capacity: usize,
    bytes: Vec<u8>,
    staged: Vec<StagedFragment>,
    high_water: usize,
    mode: Option<TransferMode>,
    transfer: TransferId,
    next_transfer: u64,
}

impl ReassemblyBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: Vec::with_capacity(capacity),
            staged: Vec::new(),
            high_water: 0,
            mode: None,
            transfer: TransferId(0),
            next_transfer: 1,
        }
    }

    /// Logical length of the in-flight transfer
    pub fn len(&self) -> usize {
        match self.mode {
            Some(TransferMode::Append) => self.bytes.len(),
            Some(TransferMode::Prepared) => self.high_water,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mode(&self) -> Option<TransferMode> {
        self.mode
    }

    /// Identity of the in-flight transfer, if any
    pub fn active_transfer(&self) -> Option<TransferId> {
        self.mode.map(|_| self.transfer)
    }

    fn begin(&mut self, mode: TransferMode) {
        if let Some(previous) = self.mode {
            warn!(
                transfer = %self.transfer,
                ?previous,
                next = ?mode,
                "Abandoning pending transfer"
            );
        }
        self.reset();
        self.mode = Some(mode);
        self.transfer = TransferId(self.next_transfer);
        self.next_transfer += 1;
        debug!(transfer = %self.transfer, ?mode, "Transfer started");
    }

    fn overflow(&mut self) -> ProvisioningError {
        warn!(
            transfer = %self.transfer,
            capacity = self.capacity,
            "Credential buffer overflow"
        );
        self.reset();
        ProvisioningError::BufferOverflow {
            capacity: self.capacity,
        }
    }

    /// Append a write-without-response (or plain write) fragment
    pub fn append(
        &mut self,
        fragment: &[u8],
        framing: &dyn FramingStrategy,
    ) -> Result<AppendOutcome, ProvisioningError> {
        if self.mode != Some(TransferMode::Append) {
            self.begin(TransferMode::Append);
        }

        if self.bytes.len() + fragment.len() > self.capacity {
            return Err(self.overflow());
        }

        self.bytes.extend_from_slice(fragment);
        debug!(
            transfer = %self.transfer,
            fragment = fragment.len(),
            total = self.bytes.len(),
            "Buffered fragment"
        );

        if framing.is_complete(&self.bytes) {
            let payload = framing.payload(&self.bytes).to_vec();
            self.reset();
            Ok(AppendOutcome::Complete(payload))
        } else {
            Ok(AppendOutcome::Pending {
                transfer: self.transfer,
                len: self.bytes.len(),
            })
        }
    }

    /// Stage a prepared-write fragment at `offset`; returns the logical length
    pub fn stage(&mut self, offset: usize, fragment: &[u8]) -> Result<usize, ProvisioningError> {
        if self.mode != Some(TransferMode::Prepared) {
            self.begin(TransferMode::Prepared);
        }

        let end = offset + fragment.len();
        if end > self.capacity || self.staged.len() >= MAX_PREPARED_FRAGMENTS {
            return Err(self.overflow());
        }

        self.staged.push(StagedFragment {
            offset,
            bytes: fragment.to_vec(),
        });
        self.high_water = self.high_water.max(end);
        debug!(
            transfer = %self.transfer,
            offset,
            fragment = fragment.len(),
            total = self.high_water,
            "Staged prepared fragment"
        );
        Ok(self.high_water)
    }

    /// Apply staged fragments in offset order and hand out the payload.
    ///
    /// Returns `None` when no prepared transfer is pending.
    pub fn commit(&mut self) -> Option<Vec<u8>> {
        if self.mode != Some(TransferMode::Prepared) {
            return None;
        }

        let mut payload = vec![0u8; self.high_water];
        // Stable: equal offsets keep arrival order, later writes win.
        self.staged.sort_by_key(|fragment| fragment.offset);
        for fragment in &self.staged {
            payload[fragment.offset..fragment.offset + fragment.bytes.len()]
                .copy_from_slice(&fragment.bytes);
        }

        self.reset();
        Some(payload)
    }

    /// Hand out whatever is buffered, complete or not, and reset
    pub fn take(&mut self) -> Vec<u8> {
        let payload = match self.mode {
            Some(TransferMode::Append) => self.bytes.clone(),
            Some(TransferMode::Prepared) => return self.commit().unwrap_or_default(),
            None => Vec::new(),
        };
        self.reset();
        payload
    }

    /// Discard the in-flight transfer and scrub its bytes
    pub fn reset(&mut self) {
        self.bytes.zeroize();
        for fragment in self.staged.iter_mut() {
            fragment.bytes.zeroize();
        }
        self.staged.clear();
        self.high_water = 0;
        self.mode = None;
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new(CREDENTIAL_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for ReassemblyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReassemblyBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("mode", &self.mode)
            .field("transfer", &self.active_transfer())
            .finish()
    }
}

impl Drop for ReassemblyBuffer {
    fn drop(&mut self) {
        self.reset();
    }
}
