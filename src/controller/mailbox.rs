//! Read-write mailbox codec.
//!
//! The controller hosts a scratchpad split into a read-only region (product
//! information) and a read-write region addressed as 32-bit words. The first
//! two read-write slots are reserved: slot 0 is the instance-lock flag,
//! slot 1 the user custom field; the user data area starts at slot 2.
//!
//! The hardware only supports whole-region writes, so writing a single slot
//! is a read-modify-write transaction held under the controller guard.

use super::driver::MailboxImage;
use super::DrmController;
use crate::error::{DrmError, Result};
use tracing::debug;

/// Reserved slots at the start of the read-write mailbox region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSlot {
    /// Flag marking the controller as owned by one agent instance.
    InstanceLock,
    /// Free-form 32-bit field for the host application.
    CustomField,
    /// First word of the user data area.
    User,
}

impl MailboxSlot {
    pub fn index(self) -> u32 {
        match self {
            MailboxSlot::InstanceLock => 0,
            MailboxSlot::CustomField => 1,
            MailboxSlot::User => 2,
        }
    }
}

/// The instance-lock feature is disabled pending clarification of the
/// ownership contract; slot 0 stays reserved for it.
const INSTANCE_LOCK_ENABLED: bool = false;

impl DrmController {
    /// Snapshot both mailbox regions.
    pub fn mailbox_image(&self) -> Result<MailboxImage> {
        self.run(|d| {
            d.select_mailbox_page()?;
            d.read_mailbox()
        })
    }

    /// Size of the user data area, in words.
    pub fn mailbox_user_size(&self) -> Result<u32> {
        let image = self.mailbox_image()?;
        Ok(image.rw_size.saturating_sub(MailboxSlot::User.index()))
    }

    /// Read one reserved or user slot.
    ///
    /// An index beyond the region means the agent and the hardware disagree
    /// about the mailbox layout, which is fatal.
    pub fn read_mailbox_word(&self, index: u32) -> Result<u32> {
        let _lock = self.guard();
        let image = self.mailbox_image()?;
        let word = *image.rw_words.get(index as usize).ok_or_else(|| {
            DrmError::Controller(format!(
                "index {index} overflows the mailbox memory; max index is {}",
                image.rw_words.len().saturating_sub(1)
            ))
        })?;
        debug!(index, word, "read mailbox word");
        Ok(word)
    }

    /// Read `count` words starting at `index`.
    pub fn read_mailbox_words(&self, index: u32, count: u32) -> Result<Vec<u32>> {
        let _lock = self.guard();
        let image = self.mailbox_image()?;
        let end = index as usize + count as usize;
        if end > image.rw_words.len() {
            return Err(DrmError::BadArgument(format!(
                "trying to read out of mailbox memory space; size is {}",
                image.rw_words.len()
            )));
        }
        Ok(image.rw_words[index as usize..end].to_vec())
    }

    /// Write one slot, preserving every other slot.
    pub fn write_mailbox_word(&self, index: u32, value: u32) -> Result<()> {
        let _lock = self.guard();
        let mut image = self.mailbox_image()?;
        let slot = image.rw_words.get_mut(index as usize).ok_or_else(|| {
            DrmError::Controller(format!(
                "index {index} overflows the mailbox memory; max index is {}",
                image.rw_size.saturating_sub(1)
            ))
        })?;
        *slot = value;
        self.run(|d| {
            d.select_mailbox_page()?;
            d.write_mailbox(&image.rw_words)
        })?;
        debug!(index, value, "wrote mailbox word");
        Ok(())
    }

    /// Write a span of words starting at `index`, preserving the rest.
    pub fn write_mailbox_words(&self, index: u32, values: &[u32]) -> Result<()> {
        let _lock = self.guard();
        let mut image = self.mailbox_image()?;
        let end = index as usize + values.len();
        if end > image.rw_words.len() {
            return Err(DrmError::BadArgument(format!(
                "trying to write out of mailbox memory space; size is {}",
                image.rw_words.len()
            )));
        }
        image.rw_words[index as usize..end].copy_from_slice(values);
        self.run(|d| {
            d.select_mailbox_page()?;
            d.write_mailbox(&image.rw_words)
        })?;
        debug!(index, count = values.len(), "wrote mailbox words");
        Ok(())
    }

    /// Mark the controller as owned by this agent instance (slot 0).
    pub fn acquire_instance_lock(&self) -> Result<()> {
        if !INSTANCE_LOCK_ENABLED {
            return Ok(());
        }
        let _lock = self.guard();
        if self.read_mailbox_word(MailboxSlot::InstanceLock.index())? != 0 {
            return Err(DrmError::BadUsage(
                "another DRM agent instance currently owns the controller".to_string(),
            ));
        }
        self.write_mailbox_word(MailboxSlot::InstanceLock.index(), 1)?;
        debug!("controller locked to this agent instance");
        Ok(())
    }

    /// Release the instance-lock flag if this instance holds it.
    pub fn release_instance_lock(&self) -> Result<()> {
        if !INSTANCE_LOCK_ENABLED {
            return Ok(());
        }
        let _lock = self.guard();
        if self.read_mailbox_word(MailboxSlot::InstanceLock.index())? != 0 {
            self.write_mailbox_word(MailboxSlot::InstanceLock.index(), 0)?;
            debug!("controller unlocked from this agent instance");
        }
        Ok(())
    }
}
