//! ## Quirks
//!
//! A menagerie of USBTMC interface quirks of different devices.
//!
//! Many (perhaps most) devices that claim USBTMC support do not fully follow
//! the standard. Behaviour differences are data, not code paths: each device
//! gets a [`QuirksRecord`] of enumerated overrides plus optional hooks, and
//! the rest of the engine reads the record without ever mutating it.
//!

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::misc;
use crate::error::{Error, Result};
use crate::types::{DeviceState, Transaction};

/// What to do when INITIATE_ABORT fails or its status poll times out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortRecoveryPolicy {
    /// Surface the error, leaving the handle halted.
    #[default]
    Spec,
    /// Run the full INITIATE_CLEAR sequence and clear both bulk halts.
    Clear,
    /// Release and re-claim the interface, resetting the bTag counter.
    Reopen,
}

/// Which channel READ_STATUS_BYTE answers arrive on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StbChannel {
    /// The class control response carries the status byte.
    #[default]
    Control,
    /// The status byte arrives on the interrupt-in endpoint.
    Interrupt,
    /// Query both and require agreement.
    Both,
}

/// Per-device behavioural overrides. Every field has the compliant default,
/// so an absent record means "behave per the standard".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuirksRecord {
    /// Device pads bulk-in transfers up to the packet size instead of the
    /// standard 4-byte alignment.
    pub read_extra_alignment_padding: bool,
    /// Treat the GET_CAPABILITIES response as unreliable and skip capability
    /// gates on USB488 operations.
    pub ignore_capabilities_flags: bool,
    /// Device omits the EOM bit on the final transfer but terminates it with
    /// a short packet.
    pub accept_short_read_as_eom: bool,
    /// Device ships in an unusable state; run the clear sequence right after
    /// open before any I/O.
    pub requires_clear_before_first_io: bool,
    /// Put the device in remote mode (REN_CONTROL true) right after open.
    pub remote_at_open: bool,
    pub abort_recovery_policy: AbortRecoveryPolicy,
    pub read_status_byte_via: StbChannel,
    /// Cap for the TransferSize field of a single bulk transfer.
    pub max_transfer_size: u32,
    /// Mandatory settle delay after a write with EOM, in microseconds.
    pub post_write_settle_us: u64,
    /// Accept headers whose reserved bytes are nonzero.
    pub tolerate_reserved_header_bytes: bool,
    /// Device reports TransferSize *including* the alignment padding; relax
    /// the size check and strip trailing NULs after the terminator.
    pub report_padded_transfer_size: bool,
    /// Device wedges its bulk-in endpoint during a clear; clear that halt too.
    pub clear_resets_bulk_in: bool,
    /// Device cannot survive the INITIATE_CLEAR sequence at all.
    pub clear_disabled: bool,
    /// Skip the intermediate bulk-in drain reads CHECK_CLEAR_STATUS asks for.
    pub clear_skip_intermediate_reads: bool,
    /// Firmware appends NUL bytes to string descriptors; strip them.
    pub strip_string_descriptor_nuls: bool,
}

impl Default for QuirksRecord {
    fn default() -> QuirksRecord {
        QuirksRecord {
            read_extra_alignment_padding: false,
            ignore_capabilities_flags: false,
            accept_short_read_as_eom: false,
            requires_clear_before_first_io: false,
            remote_at_open: false,
            abort_recovery_policy: AbortRecoveryPolicy::Spec,
            read_status_byte_via: StbChannel::Control,
            max_transfer_size: misc::DEFAULT_MAX_TRANSFER_SIZE,
            post_write_settle_us: 0,
            tolerate_reserved_header_bytes: false,
            report_padded_transfer_size: false,
            clear_resets_bulk_in: false,
            clear_disabled: false,
            clear_skip_intermediate_reads: false,
            strip_string_descriptor_nuls: false,
        }
    }
}

/// Verdict of a hook invocation.
pub enum HookAction {
    /// Proceed with the operation unchanged.
    Continue,
    /// Proceed with the given transaction substituted for the live one.
    Replace(Transaction),
    /// Abort the operation with this error.
    Fail(Error),
}

/// What a hook gets to look at.
pub struct HookContext<'a> {
    pub vendor_id: u16,
    pub product_id: u16,
    pub state: DeviceState,
    /// The live transaction; absent for the open-time hooks.
    pub transaction: Option<&'a Transaction>,
}

pub type Hook = Arc<dyn Fn(&HookContext<'_>) -> HookAction + Send + Sync>;

/// Optional per-device override points, consulted by the engine around each
/// operation.
#[derive(Clone, Default)]
pub struct Hooks {
    pub pre_open: Option<Hook>,
    pub post_open: Option<Hook>,
    pub before_write: Option<Hook>,
    pub after_write: Option<Hook>,
    pub before_read: Option<Hook>,
    pub after_read: Option<Hook>,
    /// Consulted before the standard abort recovery runs. `Replace` is
    /// treated as `Continue`: there is no transaction to substitute.
    pub abort_override: Option<Hook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            ("pre_open", self.pre_open.is_some()),
            ("post_open", self.post_open.is_some()),
            ("before_write", self.before_write.is_some()),
            ("after_write", self.after_write.is_some()),
            ("before_read", self.before_read.is_some()),
            ("after_read", self.after_read.is_some()),
            ("abort_override", self.abort_override.is_some()),
        ]
        .iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect();
        f.debug_struct("Hooks").field("installed", &names).finish()
    }
}

struct RegistryEntry {
    vendor_id: u16,
    product_id: u16,
    /// When set, the entry only applies to this bcdDevice revision.
    revision: Option<u16>,
    record: QuirksRecord,
    hooks: Hooks,
}

/// Process-wide table of `(vid, pid[, revision]) -> QuirksRecord` entries.
///
/// Built-in entries cover the catalogued instruments; callers may register
/// more before opening a device. `open` merges the matching entry with the
/// defaults and freezes the result into the handle, so later registrations
/// never affect handles that are already open.
#[derive(Default)]
pub struct QuirksRegistry {
    entries: Vec<RegistryEntry>,
}

impl QuirksRegistry {
    fn with_builtin_entries() -> QuirksRegistry {
        let mut registry = QuirksRegistry::default();

        // Thorlabs PM101U powermeter.
        registry.push(0x1313, 0x8076, None, QuirksRecord {
            requires_clear_before_first_io: true,
            clear_resets_bulk_in: true,
            clear_skip_intermediate_reads: true,
            ..Default::default()
        });
        // Thorlabs PM100D powermeter.
        registry.push(0x1313, 0x8078, None, QuirksRecord {
            requires_clear_before_first_io: true,
            clear_resets_bulk_in: true,
            ..Default::default()
        });
        // Rigol DS1102D oscilloscope.
        registry.push(0x1ab1, 0x0588, None, QuirksRecord {
            strip_string_descriptor_nuls: true,
            ..Default::default()
        });
        // Siglent SDS1204X-E oscilloscope.
        registry.push(0xf4ec, 0xee38, None, QuirksRecord {
            clear_disabled: true,
            report_padded_transfer_size: true,
            accept_short_read_as_eom: true,
            ..Default::default()
        });

        registry
    }

    fn push(&mut self, vid: u16, pid: u16, revision: Option<u16>, record: QuirksRecord) {
        self.entries.push(RegistryEntry {
            vendor_id: vid,
            product_id: pid,
            revision,
            record,
            hooks: Hooks::default(),
        });
    }

    /// Register an override record for a device. Later registrations for the
    /// same device win over earlier ones (including the built-ins).
    pub fn register(&mut self, vid: u16, pid: u16, record: QuirksRecord) {
        self.push(vid, pid, None, record);
    }

    /// Register an override keyed to a specific bcdDevice revision.
    pub fn register_revision(&mut self, vid: u16, pid: u16, revision: u16, record: QuirksRecord) {
        self.push(vid, pid, Some(revision), record);
    }

    /// Register an override record together with behavioural hooks.
    pub fn register_with_hooks(&mut self, vid: u16, pid: u16, record: QuirksRecord, hooks: Hooks) {
        self.entries.push(RegistryEntry {
            vendor_id: vid,
            product_id: pid,
            revision: None,
            record,
            hooks,
        });
    }

    /// Merge overlay records from a TOML file. Tables are keyed by
    /// `"vid:pid"` hex pairs:
    ///
    /// ```toml
    /// ["1313:8078"]
    /// clear_resets_bulk_in = true
    /// ```
    pub fn load_overlay(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        self.load_overlay_str(&text)
    }

    pub fn load_overlay_str(&mut self, text: &str) -> Result<()> {
        let table: HashMap<String, QuirksRecord> =
            toml::from_str(text).map_err(|e| Error::Config(format!("bad quirks overlay: {e}")))?;
        for (key, record) in table {
            let (vid, pid) = parse_vid_pid_key(&key)?;
            debug!("quirks overlay entry for {vid:04x}:{pid:04x}");
            self.register(vid, pid, record);
        }
        Ok(())
    }

    /// Look up the record and hooks for a device, merging with defaults when
    /// nothing matches. Revision-keyed entries beat revisionless ones.
    pub fn lookup(&self, vid: u16, pid: u16, revision: u16) -> (QuirksRecord, Hooks) {
        let mut found: Option<&RegistryEntry> = None;
        for entry in &self.entries {
            if entry.vendor_id != vid || entry.product_id != pid {
                continue;
            }
            match entry.revision {
                Some(rev) if rev != revision => continue,
                Some(_) => found = Some(entry),
                // Revisionless entries never displace a revision match.
                None => {
                    if !matches!(found, Some(e) if e.revision.is_some()) {
                        found = Some(entry);
                    }
                }
            }
        }
        match found {
            Some(entry) => (entry.record.clone(), entry.hooks.clone()),
            None => (QuirksRecord::default(), Hooks::default()),
        }
    }
}

fn parse_vid_pid_key(key: &str) -> Result<(u16, u16)> {
    let bad = || Error::Config(format!("quirks key {key:?} is not a vid:pid hex pair"));
    let (vid, pid) = key.split_once(':').ok_or_else(bad)?;
    Ok((
        u16::from_str_radix(vid.trim(), 16).map_err(|_| bad())?,
        u16::from_str_radix(pid.trim(), 16).map_err(|_| bad())?,
    ))
}

static REGISTRY: OnceLock<RwLock<QuirksRegistry>> = OnceLock::new();

/// The process-wide registry. Populate it before opening devices; every
/// `open` freezes its own copy of the matching record.
pub fn registry() -> &'static RwLock<QuirksRegistry> {
    REGISTRY.get_or_init(|| RwLock::new(QuirksRegistry::with_builtin_entries()))
}

pub(crate) fn lookup(vid: u16, pid: u16, revision: u16) -> (QuirksRecord, Hooks) {
    registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .lookup(vid, pid, revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_gets_compliant_defaults() {
        let registry = QuirksRegistry::with_builtin_entries();
        let (record, _) = registry.lookup(0xdead, 0xbeef, 0x0100);
        assert_eq!(record, QuirksRecord::default());
    }

    #[test]
    fn builtin_entry_found_for_catalogued_device() {
        let registry = QuirksRegistry::with_builtin_entries();
        let (record, _) = registry.lookup(0xf4ec, 0xee38, 0x0100);
        assert!(record.clear_disabled);
        assert!(record.report_padded_transfer_size);
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = QuirksRegistry::with_builtin_entries();
        registry.register(0x1313, 0x8078, QuirksRecord::default());
        let (record, _) = registry.lookup(0x1313, 0x8078, 0x0100);
        assert!(!record.clear_resets_bulk_in);
    }

    #[test]
    fn revision_keyed_entry_beats_revisionless() {
        let mut registry = QuirksRegistry::default();
        registry.register(0x0957, 0x1755, QuirksRecord::default());
        registry.register_revision(0x0957, 0x1755, 0x0203, QuirksRecord {
            accept_short_read_as_eom: true,
            ..Default::default()
        });
        let (record, _) = registry.lookup(0x0957, 0x1755, 0x0203);
        assert!(record.accept_short_read_as_eom);
        let (record, _) = registry.lookup(0x0957, 0x1755, 0x0100);
        assert!(!record.accept_short_read_as_eom);
    }

    #[test]
    fn overlay_parses_hex_keys_and_partial_records() {
        let mut registry = QuirksRegistry::default();
        registry
            .load_overlay_str(
                r#"
                ["0957:1755"]
                accept_short_read_as_eom = true
                max_transfer_size = 64
                abort_recovery_policy = "clear"
                "#,
            )
            .unwrap();
        let (record, _) = registry.lookup(0x0957, 0x1755, 0);
        assert!(record.accept_short_read_as_eom);
        assert_eq!(record.max_transfer_size, 64);
        assert_eq!(record.abort_recovery_policy, AbortRecoveryPolicy::Clear);
        // Unnamed fields keep their defaults.
        assert!(!record.clear_disabled);
    }

    #[test]
    fn overlay_rejects_bad_keys() {
        let mut registry = QuirksRegistry::default();
        let err = registry.load_overlay_str("[\"not-a-pair\"]\nclear_disabled = true\n");
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
