use crate::stream::{InputStream, IoMode, OutputStream};
use crate::sync::Event;
use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Transfer until the source reports empty.
pub const PIPE_ALL: u64 = u64::MAX;

const SEQUENTIAL_BUFFER_SIZE: usize = 64 * 1024;

const CONCURRENT_BUFFER_COUNT: u64 = 4;
const CONCURRENT_BUFFER_SIZE: usize = 4 * 1024 * 1024;
const INITIAL_CHUNK_SIZE: usize = 64 * 1024;

/// A read finishing faster than this doubles the next chunk, up to the
/// buffer size, adapting the reader to source throughput.
const CHUNK_GROWTH_LATENCY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    /// Single scratch buffer, read-then-write loop. Minimal memory overhead.
    Sequential,

    /// A ring of buffers with the reads running concurrently to the writes,
    /// overlapping source and sink latency at the cost of up to 16 MiB of
    /// buffering.
    Concurrent,
}

/// Copy `nbytes` from `source` to `sink`.
///
/// With `nbytes == PIPE_ALL` the copy runs until the source reports empty;
/// otherwise exactly `nbytes` must transfer or the operation fails. Returns
/// the number of bytes moved. The sink is flushed but not finalized.
pub fn pipe<S, D>(source: &mut S, sink: &mut D, nbytes: u64, mode: PipeMode) -> Result<u64>
where
    S: InputStream + Send + ?Sized,
    D: OutputStream + ?Sized,
{
    match mode {
        PipeMode::Sequential => pipe_sequential(source, sink, nbytes),
        PipeMode::Concurrent => pipe_concurrent(source, sink, nbytes).map(|stats| stats.bytes),
    }
}

fn pipe_sequential<S, D>(source: &mut S, sink: &mut D, nbytes: u64) -> Result<u64>
where
    S: InputStream + ?Sized,
    D: OutputStream + ?Sized,
{
    let mut buf = vec![0u8; SEQUENTIAL_BUFFER_SIZE];
    let mut transferred = 0u64;

    if nbytes == PIPE_ALL {
        while !source.empty()? {
            let want = source
                .least_size()?
                .clamp(1, SEQUENTIAL_BUFFER_SIZE as u64) as usize;
            let n = source.read(&mut buf[..want], IoMode::Once)?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n], IoMode::All)?;
            transferred += n as u64;
        }
    } else {
        while transferred < nbytes {
            let want = (nbytes - transferred).min(SEQUENTIAL_BUFFER_SIZE as u64) as usize;
            let n = source.read(&mut buf[..want], IoMode::Once)?;
            if n == 0 {
                bail!("source exhausted after {transferred} of {nbytes} bytes");
            }
            sink.write(&buf[..n], IoMode::All)?;
            transferred += n as u64;
        }
    }

    sink.flush()?;
    Ok(transferred)
}

pub(crate) struct PipeStats {
    pub(crate) bytes: u64,
    /// Largest chunk size the adaptive reader reached.
    pub(crate) peak_chunk: usize,
}

struct Ring {
    slots: [Mutex<Vec<u8>>; CONCURRENT_BUFFER_COUNT as usize],
    state: Mutex<RingState>,
    event: Event,
}

/// The indices increase monotonically over the whole transfer; slot selection
/// and fill tracking use modular arithmetic (`wrapping_sub`), so the protocol
/// stays correct even if a transfer were long enough to wrap 64 bits.
struct RingState {
    read_idx: u64,
    write_idx: u64,
    reader_done: bool,
    abort: bool,
}

/// Invariant: `read_idx - write_idx` stays between 0 and
/// `CONCURRENT_BUFFER_COUNT`. The reader owns the slot at `read_idx` while
/// that difference is below the buffer count; the writer owns the slot at
/// `write_idx` while it is above zero.
fn pipe_concurrent<S, D>(source: &mut S, sink: &mut D, nbytes: u64) -> Result<PipeStats>
where
    S: InputStream + Send + ?Sized,
    D: OutputStream + ?Sized,
{
    let ring = Ring {
        slots: std::array::from_fn(|_| Mutex::new(Vec::new())),
        state: Mutex::new(RingState {
            read_idx: 0,
            write_idx: 0,
            reader_done: false,
            abort: false,
        }),
        event: Event::new(),
    };

    let mut transferred = 0u64;
    let mut write_err: Option<anyhow::Error> = None;

    let reader_result = thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let result = reader_loop(source, &ring, nbytes);
            ring.state.lock().reader_done = true;
            ring.event.emit();
            result
        });

        // The writer runs on the caller's side of the ring.
        let mut write_idx = 0u64;
        let mut last = ring.event.emit_count();

        loop {
            let available = loop {
                let state = ring.state.lock();
                let available = state.read_idx.wrapping_sub(write_idx) > 0;
                if available || state.reader_done {
                    break available;
                }
                drop(state);
                last = ring.event.wait(last);
            };

            // Nothing left and the reader is finished.
            if !available {
                break;
            }

            let slot = ring.slots[(write_idx % CONCURRENT_BUFFER_COUNT) as usize].lock();
            match sink.write(&slot, IoMode::All) {
                Ok(_) => transferred += slot.len() as u64,
                Err(e) => {
                    write_err = Some(e);
                    drop(slot);
                    // The reader treats the abort flag as a cooperative stop.
                    ring.state.lock().abort = true;
                    ring.event.emit();
                    break;
                }
            }
            drop(slot);

            write_idx = write_idx.wrapping_add(1);
            ring.state.lock().write_idx = write_idx;
            ring.event.emit();
        }

        reader.join().expect("pipe reader thread panicked")
    });

    if let Some(e) = write_err {
        return Err(e);
    }
    let (_, peak_chunk) = reader_result?;

    if nbytes != PIPE_ALL && transferred != nbytes {
        bail!("pipe transferred {transferred} of {nbytes} requested bytes");
    }

    sink.flush()?;
    Ok(PipeStats {
        bytes: transferred,
        peak_chunk,
    })
}

fn reader_loop<S>(source: &mut S, ring: &Ring, nbytes: u64) -> Result<(u64, usize)>
where
    S: InputStream + ?Sized,
{
    let mut chunk_size = INITIAL_CHUNK_SIZE;
    let mut peak_chunk = chunk_size;
    let mut read_idx = 0u64;
    let mut total = 0u64;
    let mut last = ring.event.emit_count();

    loop {
        // Wait for a free slot.
        loop {
            let state = ring.state.lock();
            if state.abort {
                return Ok((total, peak_chunk));
            }
            if read_idx.wrapping_sub(state.write_idx) < CONCURRENT_BUFFER_COUNT {
                break;
            }
            drop(state);
            last = ring.event.wait(last);
        }

        let want = if nbytes == PIPE_ALL {
            if source.empty()? {
                break;
            }
            source.least_size()?.clamp(1, chunk_size as u64) as usize
        } else {
            let remaining = nbytes - total;
            if remaining == 0 {
                break;
            }
            remaining.min(chunk_size as u64) as usize
        };

        let mut slot = ring.slots[(read_idx % CONCURRENT_BUFFER_COUNT) as usize].lock();
        slot.resize(want, 0);

        let started = Instant::now();
        let n = source.read(&mut slot, IoMode::Once)?;
        slot.truncate(n);
        drop(slot);

        if n == 0 {
            if nbytes != PIPE_ALL {
                bail!("source exhausted after {total} of {nbytes} bytes");
            }
            break;
        }

        if started.elapsed() < CHUNK_GROWTH_LATENCY && chunk_size < CONCURRENT_BUFFER_SIZE {
            chunk_size = (chunk_size * 2).min(CONCURRENT_BUFFER_SIZE);
            peak_chunk = chunk_size;
        }

        total += n as u64;
        read_idx = read_idx.wrapping_add(1);
        ring.state.lock().read_idx = read_idx;
        ring.event.emit();
    }

    Ok((total, peak_chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MemoryStream, NullSink};
    use rstest::rstest;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[rstest]
    #[case::sequential(PipeMode::Sequential)]
    #[case::concurrent(PipeMode::Concurrent)]
    fn test_pipe_all_copies_everything(#[case] mode: PipeMode) {
        let data = patterned(1024 * 1024 + 13);
        let mut source = MemoryStream::from_vec(data.clone());
        let mut sink = MemoryStream::new();

        let moved = pipe(&mut source, &mut sink, PIPE_ALL, mode).unwrap();

        assert_eq!(moved, data.len() as u64);
        assert_eq!(sink.into_inner(), data);
    }

    #[rstest]
    #[case::sequential(PipeMode::Sequential)]
    #[case::concurrent(PipeMode::Concurrent)]
    fn test_pipe_exact_byte_count(#[case] mode: PipeMode) {
        let data = patterned(300 * 1024);
        let mut source = MemoryStream::from_vec(data.clone());
        let mut sink = MemoryStream::new();

        let moved = pipe(&mut source, &mut sink, 200 * 1024, mode).unwrap();

        assert_eq!(moved, 200 * 1024);
        assert_eq!(sink.into_inner(), data[..200 * 1024]);
        // The remainder stays in the source.
        assert_eq!(source.least_size().unwrap(), 100 * 1024);
    }

    #[rstest]
    #[case::sequential(PipeMode::Sequential)]
    #[case::concurrent(PipeMode::Concurrent)]
    fn test_pipe_fails_when_source_is_short(#[case] mode: PipeMode) {
        let mut source = MemoryStream::from_vec(patterned(1000));
        let mut sink = MemoryStream::new();

        assert!(pipe(&mut source, &mut sink, 2000, mode).is_err());
    }

    #[rstest]
    #[case::sequential(PipeMode::Sequential)]
    #[case::concurrent(PipeMode::Concurrent)]
    fn test_pipe_empty_source(#[case] mode: PipeMode) {
        let mut source = MemoryStream::new();
        let mut sink = MemoryStream::new();

        assert_eq!(pipe(&mut source, &mut sink, PIPE_ALL, mode).unwrap(), 0);
        assert_eq!(pipe(&mut source, &mut sink, 0, mode).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_pipe_64_mib_grows_chunk_size() {
        let len = 64 * 1024 * 1024;
        let data = patterned(len);
        let mut source = MemoryStream::from_vec(data.clone());
        let mut sink = MemoryStream::new();

        let stats = pipe_concurrent(&mut source, &mut sink, PIPE_ALL).unwrap();

        assert_eq!(stats.bytes, len as u64);
        // An in-memory source completes every read well under the latency
        // threshold, so the adaptive chunk must have grown.
        assert!(stats.peak_chunk > INITIAL_CHUNK_SIZE);
        assert_eq!(sink.into_inner(), data);
    }

    #[test]
    fn test_pipe_into_null_sink() {
        let mut source = MemoryStream::from_vec(patterned(128 * 1024));
        let mut sink = NullSink::default();

        let moved = pipe(&mut source, &mut sink, PIPE_ALL, PipeMode::Concurrent).unwrap();

        assert_eq!(moved, 128 * 1024);
        assert_eq!(sink.discarded(), 128 * 1024);
    }
}
