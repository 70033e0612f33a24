//! Demonstration binary: create a pre-allocated file and append fixed-size
//! records through the engine, the way a consensus log would.

use anyhow::{Context, Result};
use durafile::cli::Cli;
use durafile::engine::platform;
use durafile::util::buffer::AlignedBuffer;
use durafile::FileHandle;
use rand::RngCore;
use std::time::Instant;
use tokio::task::JoinHandle;

type PendingWrite = JoinHandle<(durafile::Result<usize>, Vec<Vec<u8>>)>;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let start = Instant::now();

    let dir = cli
        .target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));

    let caps = platform::probe(dir).context("platform probe failed")?;
    if cli.debug {
        eprintln!(
            "DEBUG: probe: async_capable={} direct_capable={} dsync_capable={} block_size={}",
            caps.async_capable, caps.direct_capable, caps.dsync_capable, caps.block_size
        );
    }

    let handle = FileHandle::create(&cli.target, cli.size, cli.max_writes, cli.direct, caps)
        .await
        .context("create failed")?;
    if cli.debug {
        eprintln!("DEBUG: created {} in {:.3}s", cli.target.display(), start.elapsed().as_secs_f64());
    }

    // Direct I/O requires the buffer address, offset and length to all
    // satisfy the filesystem's block alignment; round the record size up
    // to the probed block size so every offset (a multiple of the stride)
    // and every buffer length qualify. Buffered writes have no such
    // requirement and use the record size as given.
    let record_size = if cli.direct {
        round_up(cli.record_size, caps.block_size as usize)
    } else {
        cli.record_size
    };

    let mut pending: Vec<PendingWrite> = Vec::with_capacity(cli.max_writes);
    let mut offset = 0u64;
    let mut rng = rand::thread_rng();

    for i in 0..cli.count {
        if offset + record_size as u64 > cli.size {
            eprintln!("stopping early: record {i} would exceed the pre-allocated size");
            break;
        }

        let buf = if cli.direct {
            let mut aligned = AlignedBuffer::new(record_size, caps.block_size as usize);
            rng.fill_bytes(aligned.as_mut_slice());
            aligned.to_vec()
        } else {
            let mut buf = vec![0u8; record_size];
            rng.fill_bytes(&mut buf);
            buf
        };
        let write_offset = offset;
        offset += record_size as u64;

        if pending.len() >= cli.max_writes {
            let done = pending.remove(0);
            drain_one(done, cli.debug).await?;
        }
        let handle = handle.clone();
        pending.push(tokio::task::spawn_local(async move {
            handle.write(vec![buf], write_offset).await
        }));
    }

    for fut in pending {
        drain_one(fut, cli.debug).await?;
    }

    handle.close().await;
    println!(
        "wrote {} records ({} bytes each) to {} in {:.3}s",
        cli.count,
        record_size,
        cli.target.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Rounds `n` up to the next multiple of `align` (`align` must be a power
/// of two, as block sizes always are).
fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

async fn drain_one(fut: PendingWrite, debug: bool) -> Result<()> {
    let (result, _bufs) = fut.await.context("write task panicked")?;
    match result {
        Ok(n) => {
            if debug {
                eprintln!("DEBUG: write completed, {n} bytes");
            }
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e)).context("write failed"),
    }
}
