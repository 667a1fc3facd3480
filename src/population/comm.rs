//! Message passing between ranks of a distributed walker population.
//!
//! [`Communicator`] is the collective surface the comb needs: gather to the
//! root, broadcast from the root, tagged point-to-point transfers and a
//! barrier. [`FakeComm`] is the single-rank case, [`ThreadComm`] runs ranks as
//! threads of one process, and `MpiComm` (feature `mpi`) wraps a real MPI world.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use num_complex::Complex64;

use crate::error::{AfqmcError, Result};

pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Concatenate every rank's `local` in rank order; `Some` on the root only.
    fn gather(&self, local: &[f64]) -> Result<Option<Vec<f64>>>;

    /// Overwrite `values` on every rank with the root's copy.
    fn broadcast_f64(&self, values: &mut [f64]) -> Result<()>;

    fn broadcast_usize(&self, values: &mut [usize]) -> Result<()>;

    fn send(&self, dest: usize, tag: usize, buf: Vec<Complex64>) -> Result<()>;

    fn receive(&self, source: usize, tag: usize) -> Result<Vec<Complex64>>;

    fn barrier(&self) -> Result<()>;

    /// Element-wise sum over ranks, available on every rank.
    fn all_reduce_sum(&self, local: &[f64]) -> Result<Vec<f64>> {
        let mut sums = vec![0.0; local.len()];
        if local.is_empty() {
            return Ok(sums);
        }
        if let Some(all) = self.gather(local)? {
            for chunk in all.chunks(local.len()) {
                sums.iter_mut().zip(chunk).for_each(|(s, v)| *s += v);
            }
        }
        self.broadcast_f64(&mut sums)?;
        Ok(sums)
    }
}

/// Single-process communicator. Point-to-point messages loop back to self.
#[derive(Debug, Default)]
pub struct FakeComm {
    mailbox: RefCell<VecDeque<(usize, Vec<Complex64>)>>,
}

impl FakeComm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for FakeComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather(&self, local: &[f64]) -> Result<Option<Vec<f64>>> {
        Ok(Some(local.to_vec()))
    }

    fn broadcast_f64(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast_usize(&self, _values: &mut [usize]) -> Result<()> {
        Ok(())
    }

    fn send(&self, dest: usize, tag: usize, buf: Vec<Complex64>) -> Result<()> {
        if dest != 0 {
            return Err(AfqmcError::CommunicationFailure {
                rank: 0,
                message: format!("no rank {dest} in a single-rank run"),
            });
        }
        self.mailbox.borrow_mut().push_back((tag, buf));
        Ok(())
    }

    fn receive(&self, _source: usize, tag: usize) -> Result<Vec<Complex64>> {
        let mut mailbox = self.mailbox.borrow_mut();
        let pos = mailbox.iter().position(|(t, _)| *t == tag).ok_or_else(|| {
            AfqmcError::CommunicationFailure { rank: 0, message: format!("no message with tag {tag}") }
        })?;
        Ok(mailbox.remove(pos).map(|(_, buf)| buf).unwrap_or_default())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

const GATHER_TAG: usize = usize::MAX;
const BROADCAST_TAG: usize = usize::MAX - 1;
const BARRIER_TAG: usize = usize::MAX - 2;

#[derive(Debug)]
enum Payload {
    Real(Vec<f64>),
    Index(Vec<usize>),
    Complex(Vec<Complex64>),
}

#[derive(Debug)]
struct Message {
    source: usize,
    tag: usize,
    payload: Payload,
}

/// Ranks as threads of one process, linked by channels.
///
/// Messages from one source arrive in send order. Messages that arrive ahead
/// of the one being waited for are parked until asked for.
///
/// Receives wait without limit unless [`ThreadComm::with_timeout`] is set.
/// A rank that fails raises the shared abort flag, which ends every wait.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    senders: Vec<mpsc::Sender<Message>>,
    inbox: mpsc::Receiver<Message>,
    pending: RefCell<Vec<Message>>,
    timeout: Option<Duration>,
    aborted: Arc<AtomicBool>,
}

/// Interval at which a waiting rank checks the abort flag.
const ABORT_POLL: Duration = Duration::from_millis(50);

impl ThreadComm {
    /// Connected communicators for `size` ranks, index = rank.
    pub fn create(size: usize) -> Vec<ThreadComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        let aborted = Arc::new(AtomicBool::new(false));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadComm {
                rank,
                senders: senders.clone(),
                inbox,
                pending: RefCell::new(Vec::new()),
                timeout: None,
                aborted: Arc::clone(&aborted),
            })
            .collect()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    fn failure(&self, message: String) -> AfqmcError {
        AfqmcError::CommunicationFailure { rank: self.rank, message }
    }

    fn post(&self, dest: usize, tag: usize, payload: Payload) -> Result<()> {
        let sender = self
            .senders
            .get(dest)
            .ok_or_else(|| self.failure(format!("no rank {dest}")))?;
        sender
            .send(Message { source: self.rank, tag, payload })
            .map_err(|_| self.failure(format!("rank {dest} hung up")))
    }

    fn take(&self, source: usize, tag: usize) -> Result<Payload> {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|m| m.source == source && m.tag == tag) {
                return Ok(pending.remove(pos).payload);
            }
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Err(self.failure(format!("aborted while waiting for rank {source} tag {tag}")));
            }
            let message = match self.inbox.recv_timeout(ABORT_POLL) {
                Ok(message) => message,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(self.failure(format!("timed out waiting for rank {source} tag {tag}")));
                    }
                    continue;
                }
                Err(e) => return Err(self.failure(format!("waiting for rank {source} tag {tag}: {e}"))),
            };
            if message.source == source && message.tag == tag {
                return Ok(message.payload);
            }
            self.pending.borrow_mut().push(message);
        }
    }

    fn mismatch(&self, source: usize) -> AfqmcError {
        self.failure(format!("unexpected payload type from rank {source}"))
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn gather(&self, local: &[f64]) -> Result<Option<Vec<f64>>> {
        if !self.is_root() {
            self.post(0, GATHER_TAG, Payload::Real(local.to_vec()))?;
            return Ok(None);
        }
        let mut all = local.to_vec();
        for source in 1..self.size() {
            match self.take(source, GATHER_TAG)? {
                Payload::Real(v) => all.extend(v),
                _ => return Err(self.mismatch(source)),
            }
        }
        Ok(Some(all))
    }

    fn broadcast_f64(&self, values: &mut [f64]) -> Result<()> {
        if self.is_root() {
            for dest in 1..self.size() {
                self.post(dest, BROADCAST_TAG, Payload::Real(values.to_vec()))?;
            }
            return Ok(());
        }
        match self.take(0, BROADCAST_TAG)? {
            Payload::Real(v) if v.len() == values.len() => values.copy_from_slice(&v),
            _ => return Err(self.mismatch(0)),
        }
        Ok(())
    }

    fn broadcast_usize(&self, values: &mut [usize]) -> Result<()> {
        if self.is_root() {
            for dest in 1..self.size() {
                self.post(dest, BROADCAST_TAG, Payload::Index(values.to_vec()))?;
            }
            return Ok(());
        }
        match self.take(0, BROADCAST_TAG)? {
            Payload::Index(v) if v.len() == values.len() => values.copy_from_slice(&v),
            _ => return Err(self.mismatch(0)),
        }
        Ok(())
    }

    fn send(&self, dest: usize, tag: usize, buf: Vec<Complex64>) -> Result<()> {
        self.post(dest, tag, Payload::Complex(buf))
    }

    fn receive(&self, source: usize, tag: usize) -> Result<Vec<Complex64>> {
        match self.take(source, tag)? {
            Payload::Complex(v) => Ok(v),
            _ => Err(self.mismatch(source)),
        }
    }

    fn barrier(&self) -> Result<()> {
        if self.is_root() {
            for source in 1..self.size() {
                self.take(source, BARRIER_TAG)?;
            }
            for dest in 1..self.size() {
                self.post(dest, BARRIER_TAG, Payload::Index(Vec::new()))?;
            }
        } else {
            self.post(0, BARRIER_TAG, Payload::Index(Vec::new()))?;
            self.take(0, BARRIER_TAG)?;
        }
        Ok(())
    }
}

/// Raises the abort flag unless the rank finished successfully.
struct AbortOnFailure {
    aborted: Arc<AtomicBool>,
    finished: bool,
}

impl Drop for AbortOnFailure {
    fn drop(&mut self) {
        if !self.finished {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }
}

/// Run `f` once per rank on named threads and collect the per-rank results.
/// A rank that returns an error or panics aborts the others.
pub fn spawn_ranks<T, F>(size: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(ThreadComm) -> Result<T> + Sync,
{
    let comms = ThreadComm::create(size);
    let f = &f;
    std::thread::scope(|scope| {
        let handles = comms
            .into_iter()
            .map(|comm| {
                std::thread::Builder::new()
                    .name(format!("afqmc-rank-{}", comm.rank()))
                    .spawn_scoped(scope, move || {
                        let mut guard = AbortOnFailure { aborted: comm.abort_handle(), finished: false };
                        let result = f(comm);
                        guard.finished = result.is_ok();
                        result
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().map_err(|_| AfqmcError::CommunicationFailure {
                    rank,
                    message: "rank thread panicked".to_string(),
                })?
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_comm_loops_back() {
        let comm = FakeComm::new();
        comm.send(0, 3, vec![Complex64::new(1.0, 2.0)]).unwrap();
        comm.send(0, 1, vec![Complex64::new(5.0, 0.0)]).unwrap();
        assert_eq!(comm.receive(0, 1).unwrap(), vec![Complex64::new(5.0, 0.0)]);
        assert_eq!(comm.receive(0, 3).unwrap(), vec![Complex64::new(1.0, 2.0)]);
        assert!(comm.receive(0, 3).is_err());
        assert_eq!(comm.gather(&[1.0, 2.0]).unwrap(), Some(vec![1.0, 2.0]));
        assert_eq!(comm.all_reduce_sum(&[4.0]).unwrap(), vec![4.0]);
    }

    #[test]
    fn test_thread_comm_collectives() {
        let results = spawn_ranks(3, |comm| {
            let rank = comm.rank() as f64;
            let gathered = comm.gather(&[rank, 10.0 * rank])?;
            let mut flags = if comm.is_root() { vec![7, 8] } else { vec![0, 0] };
            comm.broadcast_usize(&mut flags)?;
            let sums = comm.all_reduce_sum(&[rank + 1.0])?;
            comm.barrier()?;
            Ok((gathered, flags, sums))
        })
        .unwrap();
        assert_eq!(results[0].0, Some(vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0]));
        assert_eq!(results[1].0, None);
        for (_, flags, sums) in &results {
            assert_eq!(flags, &vec![7, 8]);
            assert_eq!(sums, &vec![6.0]);
        }
    }

    #[test]
    fn test_thread_comm_out_of_order_tags() {
        let results = spawn_ranks(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 0, vec![Complex64::new(0.0, 0.0)])?;
                comm.send(1, 1, vec![Complex64::new(1.0, 0.0)])?;
                Ok(Vec::new())
            } else {
                let second = comm.receive(0, 1)?;
                let first = comm.receive(0, 0)?;
                Ok(vec![first[0], second[0]])
            }
        })
        .unwrap();
        assert_eq!(results[1], vec![Complex64::new(0.0, 0.0), Complex64::new(1.0, 0.0)]);
    }

    #[test]
    fn test_failed_rank_releases_waiting_ranks() {
        let err = spawn_ranks(3, |comm| {
            if comm.rank() == 2 {
                return Err(AfqmcError::Config("rank 2 gives up".to_string()));
            }
            std::thread::sleep(Duration::from_millis(100));
            comm.barrier()
        })
        .unwrap_err();
        assert!(matches!(err, AfqmcError::CommunicationFailure { .. } | AfqmcError::Config(_)));
    }

    #[test]
    fn test_receive_waits_past_poll_interval() {
        let results = spawn_ranks(2, |comm| {
            if comm.rank() == 1 {
                std::thread::sleep(ABORT_POLL * 4);
                comm.send(0, 9, vec![Complex64::new(2.0, 0.0)])?;
                Ok(Vec::new())
            } else {
                comm.receive(1, 9)
            }
        })
        .unwrap();
        assert_eq!(results[0], vec![Complex64::new(2.0, 0.0)]);
    }

    #[test]
    fn test_thread_comm_times_out() {
        let mut comms = ThreadComm::create(2);
        let comm = comms.remove(0).with_timeout(Duration::from_millis(10));
        let err = comm.receive(1, 5).unwrap_err();
        assert!(matches!(err, AfqmcError::CommunicationFailure { rank: 0, .. }));
    }
}
