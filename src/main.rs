//! memsplit - guest memory introspection over a virtio-mmio device.
//!
//! Allocates guest RAM split around the 32-bit hole, realizes the
//! virtio-memsplit device against the resulting memory map, and exchanges a
//! few requests with it through an in-process driver. With `--kvm` the RAM
//! is also registered with a KVM VM and interrupts go through its IRQ chip.
//!
//! The VMM requires Linux. It will not run on other platforms.

mod config;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod driver;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod memory;

use clap::Parser;
use config::{Protocol, RegionModel};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "memsplit")]
#[command(about = "Guest memory introspection over a virtio-mmio device")]
struct Args {
    /// Memory size in megabytes
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// RAM below 4 GiB in megabytes; the rest is placed at 4 GiB
    #[arg(long, default_value = "3072")]
    below_4g: u64,

    /// Request/response protocol spoken by the device
    #[arg(short, long, value_enum, default_value_t = Protocol::Greeting)]
    protocol: Protocol,

    /// Which RAM subregions the device reports
    #[arg(long, value_enum, default_value_t = RegionModel::Split)]
    region_model: RegionModel,

    /// Delay completion interrupts by this many milliseconds
    #[arg(long, default_value = "0")]
    notify_delay_ms: u64,

    /// Raise a configuration-change interrupt at this period
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value = "4")]
    requests: usize,

    /// Register RAM with KVM and deliver interrupts through its IRQ chip
    #[arg(long)]
    kvm: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use config::MemsplitConfig;
    use devices::virtio::memsplit::{QUEUE_SIZE, VIRTIO_ID_MEMSPLIT};
    use devices::virtio::{
        Interrupt, IrqTrigger, STATUS_DEVICE_NEEDS_RESET, VIRTIO_MMIO_INT_CONFIG,
        VIRTIO_MMIO_INT_VRING,
    };
    use devices::{
        MmioBus, VirtioMemsplit, VirtioMmioTransport, VIRTIO_MEMSPLIT_IRQ, VIRTIO_MMIO_BASE,
        VIRTIO_MMIO_SIZE,
    };
    use driver::GuestDriver;
    use memory::{GuestMemory, MemoryLayout, Subregion};

    const MIB: u64 = 1024 * 1024;
    /// Legacy BIOS ROM just below 4 GiB.
    const BIOS_BASE: u64 = 0xfffc_0000;
    const BIOS_SIZE: u64 = 0x4_0000;
    const POLL_INTERVAL: Duration = Duration::from_millis(1);
    const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

    eprintln!("[VMM] memsplit starting...");
    eprintln!("[VMM] Memory: {} MB ({} MB below 4G)", args.memory, args.below_4g.min(args.memory));
    eprintln!("[VMM] Protocol: {:?}, region model: {:?}", args.protocol, args.region_model);

    // Allocate guest memory and describe the address space
    let layout = MemoryLayout {
        size: args.memory * MIB,
        below_4g_limit: args.below_4g * MIB,
    };
    let memory = Arc::new(GuestMemory::new(layout)?);
    eprintln!("[VMM] Guest RAM allocated: {} MB", memory.size() / MIB);
    let mut map = memory.memory_map()?;
    map.add(Subregion::mmio(
        "virtio-mmio",
        VIRTIO_MMIO_BASE,
        VIRTIO_MMIO_SIZE,
    ))?;
    if layout.below_4g_limit <= BIOS_BASE {
        map.add(Subregion::rom("bios", BIOS_BASE, BIOS_SIZE))?;
    }
    for sub in map.iter() {
        eprintln!(
            "[VMM]   {:<14} {:#012x}-{:#012x} {:?}",
            sub.name,
            sub.base,
            sub.end(),
            sub.kind
        );
    }

    // Optional KVM VM as memory consumer and interrupt sink
    let vm = if args.kvm {
        let vm = Arc::new(kvm::create_vm()?);
        // SAFETY: `memory` is kept alive until after the VM is dropped.
        unsafe { vm.register_memory(&memory)? };
        eprintln!("[VMM] KVM VM created, IRQ {}", VIRTIO_MEMSPLIT_IRQ);
        Some(vm)
    } else {
        None
    };
    let trigger = vm.as_ref().map(|vm| {
        Box::new(kvm::IrqLine::new(vm.clone(), VIRTIO_MEMSPLIT_IRQ)) as Box<dyn IrqTrigger>
    });
    let interrupt = Arc::new(Interrupt::new(trigger));

    // Create the device and put it on the bus
    let config = MemsplitConfig {
        protocol: args.protocol,
        region_model: args.region_model,
        notify_delay: Duration::from_millis(args.notify_delay_ms),
        heartbeat: args.heartbeat_ms.map(Duration::from_millis),
    };
    let device = VirtioMemsplit::new(config, memory.clone(), map, interrupt.clone());
    let transport = VirtioMmioTransport::realize(device, interrupt.clone())?;
    let mut mmio_bus = MmioBus::new();
    mmio_bus.register(VIRTIO_MMIO_BASE, VIRTIO_MMIO_SIZE, Box::new(transport))?;
    eprintln!("[VMM] virtio-memsplit registered at {:#x}", VIRTIO_MMIO_BASE);

    let mut driver = GuestDriver::connect(
        &mut mmio_bus,
        memory.clone(),
        VIRTIO_MMIO_BASE,
        VIRTIO_ID_MEMSPLIT,
        QUEUE_SIZE,
    )?;
    eprintln!("[VMM] Driver ready, queue size {}", driver.queue_size());

    // Exchange requests: post what fits, handle interrupts like a guest would
    let deadline = Instant::now() + EXCHANGE_TIMEOUT;
    let mut posted = 0;
    let mut completed = 0;
    let mut heartbeats = 0;
    while completed < args.requests {
        let mut kick = false;
        while posted < args.requests {
            let segments = demo::request(args.protocol, posted);
            if driver.free_descriptors() < segments.len() {
                break;
            }
            driver.post(&segments)?;
            posted += 1;
            kick = true;
        }
        if kick {
            driver.kick(&mut mmio_bus);
        }

        let now = Instant::now();
        let next = mmio_bus.tick(now);

        let status = driver.interrupt_status(&mut mmio_bus);
        if status != 0 {
            driver.ack_interrupt(&mut mmio_bus, status);
        }
        if status & VIRTIO_MMIO_INT_CONFIG != 0 {
            if driver.status(&mut mmio_bus) & STATUS_DEVICE_NEEDS_RESET != 0 {
                mmio_bus.shutdown();
                return Err("virtio-memsplit needs a reset".into());
            }
            heartbeats += 1;
            eprintln!("[VMM] Heartbeat {}", heartbeats);
        }
        if status & VIRTIO_MMIO_INT_VRING != 0 {
            for elem in driver.used()? {
                completed += 1;
                eprintln!("[VMM] {}", demo::describe(args.protocol, &elem));
            }
        }

        if now >= deadline {
            mmio_bus.shutdown();
            return Err(format!(
                "timed out with {}/{} requests completed",
                completed, args.requests
            )
            .into());
        }
        let wait = next.map_or(POLL_INTERVAL, |t| t.saturating_duration_since(now));
        std::thread::sleep(wait.min(POLL_INTERVAL));
    }

    mmio_bus.shutdown();
    eprintln!(
        "[VMM] {} requests completed, {} interrupts raised",
        completed,
        interrupt.raised()
    );

    drop(vm);
    drop(memory);
    Ok(())
}

/// Requests the CLI sends and how it prints their completions.
#[cfg(target_os = "linux")]
mod demo {
    use crate::config::Protocol;
    use crate::devices::virtio::memsplit::GREETING;
    use crate::driver::{Segment, UsedElem};

    pub fn request(protocol: Protocol, n: usize) -> Vec<Segment> {
        match protocol {
            Protocol::Echo => vec![Segment::Readable(
                format!("memsplit echo #{}", n).into_bytes(),
            )],
            Protocol::SizedDump => {
                let name = format!("request-{}\0", n);
                let mut bytes = (name.len() as u32).to_le_bytes().to_vec();
                bytes.extend_from_slice(name.as_bytes());
                vec![Segment::Readable(bytes)]
            }
            // Every other request gets a buffer too small for the full greeting.
            Protocol::Greeting => {
                let capacity = if n % 2 == 0 { GREETING.len() as u32 } else { 10 };
                vec![Segment::Writable(capacity)]
            }
        }
    }

    pub fn describe(protocol: Protocol, elem: &UsedElem) -> String {
        match protocol {
            Protocol::Greeting => {
                let text = elem.written.strip_suffix(b"\0").unwrap_or(&elem.written);
                format!(
                    "Request {} -> {} bytes: {:?}",
                    elem.id,
                    elem.len,
                    String::from_utf8_lossy(text)
                )
            }
            Protocol::Echo | Protocol::SizedDump => {
                format!("Request {} completed (len {})", elem.id, elem.len)
            }
        }
    }

}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("memsplit requires Linux. This platform is not supported.".into())
}
