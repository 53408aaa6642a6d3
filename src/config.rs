//! Device configuration.

use std::time::Duration;

use clap::ValueEnum;

/// Request/response shape the device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Protocol {
    /// Log the readable bytes, write nothing back.
    Echo,
    /// Log a length-prefixed name, write nothing back.
    SizedDump,
    /// Write a fixed greeting into the writable buffers.
    #[default]
    Greeting,
}

/// Which RAM subregions the registry picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RegionModel {
    /// Only `ram-below-4g` and `ram-above-4g`.
    #[default]
    Split,
    /// Every RAM-backed subregion.
    AllRam,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemsplitConfig {
    pub protocol: Protocol,
    pub region_model: RegionModel,
    /// Delay between completing a request and interrupting the guest.
    /// Zero interrupts immediately.
    pub notify_delay: Duration,
    /// Period of the configuration-change heartbeat, if any.
    pub heartbeat: Option<Duration>,
}
