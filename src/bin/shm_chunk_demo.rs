use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use shm_chunk::{
    format_segment, Error, MemoryManager, PortableChunkGroup, Segment, SegmentConfig, SegmentId,
    SegmentRegistry,
};

const SEGMENT_ID: SegmentId = 1;
const CHECKSUM_LEN: usize = 4;

/// Publishes multi-chunk groups through a file-backed segment to consumers
/// that each map the segment on their own.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backing file of the shared segment
    #[arg(short, long, default_value = "./shm-chunk-demo.shm")]
    path: PathBuf,

    /// Segment layout as JSON (defaults to the built-in layout)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of consumers every group is delivered to
    #[arg(short, long, default_value_t = 3)]
    consumers: usize,

    /// Number of groups to publish
    #[arg(short, long, default_value_t = 10_000)]
    messages: u64,

    /// Payload size of the group's first chunk
    #[arg(long, default_value_t = 96)]
    head_bytes: u32,

    /// Payload size of the group's second chunk
    #[arg(long, default_value_t = 900)]
    body_bytes: u32,
}

fn attach(path: &Path) -> Result<Arc<SegmentRegistry>> {
    let mut registry = SegmentRegistry::new();
    registry.register(
        Segment::open_file(SEGMENT_ID, path)
            .with_context(|| format!("failed to map {}", path.display()))?,
    )?;
    Ok(Arc::new(registry))
}

fn fill(payload: &mut [u8], seq: u64) {
    let (data, checksum) = payload.split_at_mut(payload.len() - CHECKSUM_LEN);
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (seq as usize).wrapping_add(i) as u8;
    }
    checksum.copy_from_slice(&crc32fast::hash(data).to_le_bytes());
}

fn verify(payload: &[u8]) -> bool {
    let (data, checksum) = payload.split_at(payload.len() - CHECKSUM_LEN);
    crc32fast::hash(data).to_le_bytes() == checksum
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.consumers == 0 {
        bail!("need at least one consumer");
    }
    if (args.head_bytes as usize) < CHECKSUM_LEN || (args.body_bytes as usize) < CHECKSUM_LEN {
        bail!("payloads must hold a {CHECKSUM_LEN} byte checksum");
    }

    let config = match &args.config {
        Some(path) => SegmentConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SegmentConfig::default(),
    };
    config.validate()?;

    let mut segment = Segment::create_file(SEGMENT_ID, &args.path, config.required_size())
        .with_context(|| format!("failed to create {}", args.path.display()))?;
    format_segment(&mut segment, &config)?;
    let mut registry = SegmentRegistry::new();
    registry.register(segment)?;
    let producer = MemoryManager::open(Arc::new(registry), SEGMENT_ID)?;

    info!("Segment: {}", args.path.display());
    info!(
        "Publishing {} groups to {} consumers",
        args.messages, args.consumers
    );

    let mut senders = Vec::with_capacity(args.consumers);
    let mut workers = Vec::with_capacity(args.consumers);
    for consumer in 0..args.consumers {
        let (tx, rx) = mpsc::sync_channel::<u64>(64);
        let registry = attach(&args.path)?;
        senders.push(tx);
        workers.push(thread::spawn(move || -> Result<u64> {
            let mut bytes = 0u64;
            for bits in rx {
                let group = PortableChunkGroup::from_bits(bits).release_to_shared(&registry);
                if group.is_empty() {
                    bail!("consumer {consumer} received an unresolvable group");
                }
                for index in 0..group.len() {
                    let payload = group.payload(index).context("chunk without payload")?;
                    if !verify(payload) {
                        bail!("consumer {consumer} saw a corrupt payload in chunk {index}");
                    }
                    bytes += payload.len() as u64;
                }
            }
            Ok(bytes)
        }));
    }

    let start = quanta::Instant::now();
    let mut retries = 0u64;
    for seq in 0..args.messages {
        let mut group = loop {
            match producer.loan(&[args.head_bytes, args.body_bytes]) {
                Ok(group) => break group,
                Err(Error::PoolExhausted { .. } | Error::GroupPoolExhausted) => {
                    retries += 1;
                    thread::yield_now();
                }
                Err(err) => return Err(err.into()),
            }
        };
        for index in 0..group.len() {
            fill(group.payload_mut(index).context("fresh group is shared")?, seq);
        }

        let (last, rest) = senders.split_last().context("no consumers")?;
        for tx in rest {
            tx.send(PortableChunkGroup::from(group.clone()).to_bits())?;
        }
        last.send(PortableChunkGroup::from(group).to_bits())?;
    }
    drop(senders);

    let mut total = 0u64;
    for worker in workers {
        total += worker.join().map_err(|_| anyhow::anyhow!("consumer panicked"))??;
    }
    let elapsed = start.elapsed();

    for pool in producer.pools() {
        let stats = pool.stats();
        info!(
            "pool {:>6} B: {} used, {} min free, {} rejected frees",
            stats.chunk_size, stats.used_chunks, stats.min_free, stats.rejected_frees
        );
    }
    let groups = producer.group_pool().context("group pool missing")?;
    info!("groups: {} used of {}", groups.used_chunks(), groups.chunk_count());
    info!(
        "Delivered {} bytes in {:?} ({} loan retries)",
        total, elapsed, retries
    );

    if groups.used_chunks() != 0 || producer.pools().iter().any(|pool| pool.used_chunks() != 0) {
        bail!("chunks still allocated after every consumer finished");
    }
    Ok(())
}

