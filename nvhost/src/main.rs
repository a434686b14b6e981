// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nvhost_common::{class, ClassId, HostError};
use nvhost_core::opcode::{self, host_reg, SyncptCond};
use nvhost_core::{
    Client, ClientConfig, Host, HostBo, JobFlags, JobHandle, PhysicalMemory, SimHardware,
    SyncpointFlags, SysmemBo,
};

/// nvhost - host1x command submission simulator
#[derive(Parser, Debug)]
#[command(name = "nvhost", version, about = "Drive the nvhost submission engine on simulated hardware")]
struct Args {
    /// Path to config file (default: $NVHOST_CONFIG or ~/.config/nvhost/nvhost.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Number of client engines to attach
    #[arg(long, default_value_t = 2)]
    clients: u32,

    /// Jobs submitted per client
    #[arg(long, default_value_t = 8)]
    jobs: u32,

    /// Per-job timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Also submit a job that never completes and let recovery handle it
    #[arg(long)]
    hang: bool,
}

const ENGINES: [(&str, ClassId); 4] = [
    ("gr2d", class::GR2D),
    ("vic", class::VIC),
    ("nvdec", class::NVDEC),
    ("nvenc", class::NVENC),
];

fn incr_stream(id: u32, count: u32) -> Vec<u32> {
    (0..count)
        .flat_map(|_| {
            [
                opcode::setclass(class::HOST1X, host_reg::INCR_SYNCPT, 1),
                opcode::incr_syncpt(SyncptCond::OpDone, id),
            ]
        })
        .collect()
}

struct ClientRun {
    client: Client,
    handles: Vec<JobHandle>,
}

fn submit_jobs(host: &Arc<Host>, client: &Client, jobs: u32, timeout: Duration) -> Result<Vec<JobHandle>> {
    let sp = client.syncpoint(0)?.id();
    let writes = !client.host().settings().firewall || host.allow_list().has_class(client.class());
    let mut handles = Vec::with_capacity(jobs as usize);
    for n in 0..jobs {
        let incrs = 1 + n % 3;
        let cmd: Arc<dyn HostBo> = SysmemBo::with_words(host.memory(), &incr_stream(sp, incrs))?;
        let mut job = client.new_job(0, incrs)?;
        if writes {
            job.add_register_write(client.class(), 0x01, n)?;
        }
        job.add_gather(cmd, 0, incrs * 2)?;
        job.set_timeout(timeout);
        let handle = client
            .submit(job)
            .with_context(|| format!("submitting job {} for {}", n, client.name()))?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Submit a job that waits on a syncpoint nobody increments and show the
/// recovery path resolving it.
fn run_hang(host: &Arc<Host>, timeout: Duration) -> Result<bool> {
    let client = Client::attach(host, ClientConfig::new("hang", class::GR2D))
        .context("attaching hang client")?;
    let gate = host
        .syncpoints()
        .allocate("hang", SyncpointFlags::CLIENT_MANAGED, "gate")?;
    let sp = client.syncpoint(0)?.clone();

    let cmd: Arc<dyn HostBo> = SysmemBo::with_words(host.memory(), &incr_stream(sp.id(), 1))?;
    let mut job = client.new_job(0, 1)?;
    job.add_wait(gate.id(), 1, None)?;
    job.add_gather(cmd, 0, 2)?;
    job.set_flags(job.flags() | JobFlags::SYNCPT_RECOVERY);
    job.set_timeout(timeout);
    let handle = client.submit(job)?;

    let result = handle.wait(timeout * 4 + Duration::from_secs(1));
    let recovered = result == Err(HostError::TimedOut)
        && handle.fence().error() == Some(HostError::TimedOut)
        && sp.min() == handle.syncpt_end();
    println!(
        "hang: job on channel {} -> {:?}, fence error {:?}, syncpoint[{}] min={} max={}",
        client.channel().id(),
        result,
        handle.fence().error(),
        sp.id(),
        sp.min(),
        sp.max()
    );
    if let Err(e) = host.syncpoints().release(&gate) {
        warn!("hang: gate syncpoint: {}", e);
    }
    Ok(recovered)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("nvhost - host1x command submission simulator");

    let settings = config::load_config(args.config.as_ref());
    let hw = Arc::new(SimHardware::new(
        settings.num_syncpoints,
        settings.num_syncpoint_bases,
        settings.num_channels,
    ));
    let host = Host::new(settings, hw.clone(), Arc::new(PhysicalMemory::default()))
        .context("bringing up host")?;
    let mut executor = hw.spawn_executor(Duration::from_micros(200));
    info!("Capabilities: {:?}", host.capabilities());

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut runs = Vec::new();
    for i in 0..args.clients {
        let (engine, class) = ENGINES[i as usize % ENGINES.len()];
        let config = ClientConfig::new(&format!("{}{}", engine, i), class);
        let client = Client::attach(&host, config)
            .with_context(|| format!("attaching client {}", i))?;
        let handles = submit_jobs(&host, &client, args.jobs, timeout)?;
        runs.push(ClientRun { client, handles });
    }

    let mut failures = 0;
    for run in &runs {
        let mut ok = 0;
        for handle in &run.handles {
            match handle.wait(timeout * 2) {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!("{}: job {} failed: {}", run.client.name(), handle.id(), e);
                    failures += 1;
                }
            }
        }
        let sp = run.client.syncpoint(0)?;
        println!(
            "{:8} channel {:2} syncpoint {:3}: {}/{} jobs ok, value {} (max {})",
            run.client.name(),
            run.client.channel().id(),
            sp.id(),
            ok,
            run.handles.len(),
            run.client.read_syncpoint(0)?,
            sp.max()
        );
    }

    if args.hang && !run_hang(&host, timeout)? {
        warn!("hang: job was not recovered");
        failures += 1;
    }

    if args.verbose {
        print!("{}", host.dump_state());
    }

    executor.stop();
    drop(runs);
    host.shutdown();

    if failures > 0 {
        bail!("{} jobs failed", failures);
    }
    Ok(())
}
