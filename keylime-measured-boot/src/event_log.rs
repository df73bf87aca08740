// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

// Entries of a TPM event log, as produced by a binary event log parser.
use crate::algorithms::HashAlgorithm;
use crate::digest::Digest;
use crate::vtpm::PcrIndex;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// TCG event type of an event log entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub u32);

impl EventType {
    pub const PREBOOT_CERT: EventType = EventType(0x00000000);
    pub const POST_CODE: EventType = EventType(0x00000001);
    pub const UNUSED: EventType = EventType(0x00000002);
    pub const NO_ACTION: EventType = EventType(0x00000003);
    pub const SEPARATOR: EventType = EventType(0x00000004);
    pub const ACTION: EventType = EventType(0x00000005);
    pub const EVENT_TAG: EventType = EventType(0x00000006);
    pub const S_CRTM_CONTENTS: EventType = EventType(0x00000007);
    pub const S_CRTM_VERSION: EventType = EventType(0x00000008);
    pub const CPU_MICROCODE: EventType = EventType(0x00000009);
    pub const PLATFORM_CONFIG_FLAGS: EventType = EventType(0x0000000A);
    pub const TABLE_OF_DEVICES: EventType = EventType(0x0000000B);
    pub const COMPACT_HASH: EventType = EventType(0x0000000C);
    pub const IPL: EventType = EventType(0x0000000D);
    pub const IPL_PARTITION_DATA: EventType = EventType(0x0000000E);
    pub const NONHOST_CODE: EventType = EventType(0x0000000F);
    pub const NONHOST_CONFIG: EventType = EventType(0x00000010);
    pub const NONHOST_INFO: EventType = EventType(0x00000011);
    pub const OMIT_BOOT_DEVICE_EVENTS: EventType = EventType(0x00000012);
    pub const EFI_VARIABLE_DRIVER_CONFIG: EventType = EventType(0x80000001);
    pub const EFI_VARIABLE_BOOT: EventType = EventType(0x80000002);
    pub const EFI_BOOT_SERVICES_APPLICATION: EventType =
        EventType(0x80000003);
    pub const EFI_BOOT_SERVICES_DRIVER: EventType = EventType(0x80000004);
    pub const EFI_RUNTIME_SERVICES_DRIVER: EventType = EventType(0x80000005);
    pub const EFI_GPT_EVENT: EventType = EventType(0x80000006);
    pub const EFI_ACTION: EventType = EventType(0x80000007);
    pub const EFI_PLATFORM_FIRMWARE_BLOB: EventType = EventType(0x80000008);
    pub const EFI_HANDOFF_TABLES: EventType = EventType(0x80000009);
    pub const EFI_HCRTM_EVENT: EventType = EventType(0x8000000A);

    /// Returns the TCG name of this event type.
    pub fn name(self) -> &'static str {
        match self.0 {
            0x00000000 => "EV_PREBOOT_CERT",
            0x00000001 => "EV_POST_CODE",
            0x00000002 => "EV_UNUSED",
            0x00000003 => "EV_NO_ACTION",
            0x00000004 => "EV_SEPARATOR",
            0x00000005 => "EV_ACTION",
            0x00000006 => "EV_EVENT_TAG",
            0x00000007 => "EV_S_CRTM_CONTENTS",
            0x00000008 => "EV_S_CRTM_VERSION",
            0x00000009 => "EV_CPU_MICROCODE",
            0x0000000A => "EV_PLATFORM_CONFIG_FLAGS",
            0x0000000B => "EV_TABLE_OF_DEVICES",
            0x0000000C => "EV_COMPACT_HASH",
            0x0000000D => "EV_IPL",
            0x0000000E => "EV_IPL_PARTITION_DATA",
            0x0000000F => "EV_NONHOST_CODE",
            0x00000010 => "EV_NONHOST_CONFIG",
            0x00000011 => "EV_NONHOST_INFO",
            0x00000012 => "EV_OMIT_BOOT_DEVICE_EVENTS",
            0x80000001 => "EV_EFI_VARIABLE_DRIVER_CONFIG",
            0x80000002 => "EV_EFI_VARIABLE_BOOT",
            0x80000003 => "EV_EFI_BOOT_SERVICES_APPLICATION",
            0x80000004 => "EV_EFI_BOOT_SERVICES_DRIVER",
            0x80000005 => "EV_EFI_RUNTIME_SERVICES_DRIVER",
            0x80000006 => "EV_EFI_GPT_EVENT",
            0x80000007 => "EV_EFI_ACTION",
            0x80000008 => "EV_EFI_PLATFORM_FIRMWARE_BLOB",
            0x80000009 => "EV_EFI_HANDOFF_TABLES",
            0x8000000A => "EV_EFI_HCRTM_EVENT",
            _ => "EV_UNKNOWN_TYPE",
        }
    }

    /// Looks up an event type by its TCG name.
    pub fn from_name(name: &str) -> Option<Self> {
        let value = match name {
            "EV_PREBOOT_CERT" => 0x00000000,
            "EV_POST_CODE" => 0x00000001,
            "EV_UNUSED" => 0x00000002,
            "EV_NO_ACTION" => 0x00000003,
            "EV_SEPARATOR" => 0x00000004,
            "EV_ACTION" => 0x00000005,
            "EV_EVENT_TAG" => 0x00000006,
            "EV_S_CRTM_CONTENTS" => 0x00000007,
            "EV_S_CRTM_VERSION" => 0x00000008,
            "EV_CPU_MICROCODE" => 0x00000009,
            "EV_PLATFORM_CONFIG_FLAGS" => 0x0000000A,
            "EV_TABLE_OF_DEVICES" => 0x0000000B,
            "EV_COMPACT_HASH" => 0x0000000C,
            "EV_IPL" => 0x0000000D,
            "EV_IPL_PARTITION_DATA" => 0x0000000E,
            "EV_NONHOST_CODE" => 0x0000000F,
            "EV_NONHOST_CONFIG" => 0x00000010,
            "EV_NONHOST_INFO" => 0x00000011,
            "EV_OMIT_BOOT_DEVICE_EVENTS" => 0x00000012,
            "EV_EFI_VARIABLE_DRIVER_CONFIG" => 0x80000001,
            "EV_EFI_VARIABLE_BOOT" => 0x80000002,
            "EV_EFI_BOOT_SERVICES_APPLICATION" => 0x80000003,
            "EV_EFI_BOOT_SERVICES_DRIVER" => 0x80000004,
            "EV_EFI_RUNTIME_SERVICES_DRIVER" => 0x80000005,
            "EV_EFI_GPT_EVENT" => 0x80000006,
            "EV_EFI_ACTION" => 0x80000007,
            "EV_EFI_PLATFORM_FIRMWARE_BLOB" => 0x80000008,
            "EV_EFI_HANDOFF_TABLES" => 0x80000009,
            "EV_EFI_HCRTM_EVENT" => 0x8000000A,
            _ => return None,
        };
        Some(EventType(value))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            "EV_UNKNOWN_TYPE" => write!(f, "EV_UNKNOWN_TYPE({:#010x})", self.0),
            name => write!(f, "{name}"),
        }
    }
}

/// A single event of a captured TPM event log, for one hash algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// The PCR index this event extends.
    pub pcr_index: PcrIndex,
    pub event_type: EventType,
    pub algorithm: HashAlgorithm,
    pub digest: Digest,
    /// The raw data associated with the event, if the log carries it.
    pub data: Option<Vec<u8>>,
}

/// Returns the events of `log` extending `pcr_index` in the `algorithm`
/// bank, keeping their order.
pub fn entries_for(
    log: &[EventLogEntry],
    pcr_index: PcrIndex,
    algorithm: HashAlgorithm,
) -> Vec<EventLogEntry> {
    log.iter()
        .filter(|entry| {
            entry.pcr_index == pcr_index && entry.algorithm == algorithm
        })
        .cloned()
        .collect()
}
