//! Bounded single-producer/single-consumer slot ring
//!
//! A `RingBuffer` owns `slot_count` equally sized byte slots for one
//! channel. Ownership of a slot moves between the two roles through a pair
//! of crossbeam channels carrying slot indices:
//!
//! ```text
//!            free (indices)                 ready (indices)
//!   consumer ──────────────▶ producer ────────────────────▶ consumer
//!            release()        wait() / commit()              wait() / release()
//! ```
//!
//! Each slot strictly cycles `Free -> Producing -> Ready -> Consuming -> Free`.
//! Both queues are FIFO and start with `0..slot_count`, so indices are
//! handed out in order modulo the slot count. The buffer never copies
//! sample data; roles read and write slots in place.
//!
//! The two roles are separate handle types, each taken exactly once, so a
//! second producer or consumer cannot exist. A role holds at most one slot
//! at a time.

mod cancel;

pub use cancel::CancelToken;

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{Error, Result};

/// Ownership state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Producing = 1,
    Ready = 2,
    Consuming = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::Producing,
            2 => SlotState::Ready,
            3 => SlotState::Consuming,
            _ => SlotState::Free,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Producing => "producing",
            SlotState::Ready => "ready",
            SlotState::Consuming => "consuming",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Slot {
    state: AtomicU8,
    data: UnsafeCell<Box<[u8]>>,
}

struct Shared {
    slots: Box<[Slot]>,
    slot_size: usize,
    closed: CancelToken,
}

// SAFETY: slot bytes are only reached through `SlotProducer::slot_mut` and
// `SlotConsumer::slot`, which require the role to hold the index in the
// matching reserved state. Index handoff goes through channels, giving the
// required happens-before edges, and each index is held by one role at a time.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

impl Shared {
    fn check_index(&self, index: usize) -> Result<&Slot> {
        self.slots.get(index).ok_or_else(|| {
            Error::ContractViolation(format!(
                "slot index {} out of range (slot count {})",
                index,
                self.slots.len()
            ))
        })
    }

    fn state(&self, index: usize) -> Result<SlotState> {
        Ok(SlotState::from_u8(self.check_index(index)?.state.load(Ordering::Acquire)))
    }

    fn transition(&self, index: usize, from: SlotState, to: SlotState) -> Result<()> {
        let slot = self.check_index(index)?;
        slot.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Error::ContractViolation(format!(
                    "slot {} is {}, expected {}",
                    index,
                    SlotState::from_u8(actual),
                    from
                ))
            })
    }
}

/// Fixed pool of slots shared by one producer and one consumer role
pub struct RingBuffer {
    shared: Arc<Shared>,
    producer: Option<SlotProducer>,
    consumer: Option<SlotConsumer>,
}

impl RingBuffer {
    /// Allocate `slot_count` slots of `slot_size` bytes each
    ///
    /// Allocation is fallible: an unsatisfiable request yields
    /// `OutOfMemory` instead of aborting.
    pub fn new(slot_count: usize, slot_size: usize) -> Result<Self> {
        if slot_count == 0 || slot_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "ring buffer needs non-zero geometry, got {} x {} bytes",
                slot_count, slot_size
            )));
        }
        let total = slot_count
            .checked_mul(slot_size)
            .ok_or(Error::OutOfMemory { bytes: usize::MAX })?;

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(slot_count)
            .map_err(|_| Error::OutOfMemory { bytes: total })?;
        for _ in 0..slot_count {
            let mut data = Vec::new();
            data.try_reserve_exact(slot_size)
                .map_err(|_| Error::OutOfMemory { bytes: total })?;
            data.resize(slot_size, 0u8);
            slots.push(Slot {
                state: AtomicU8::new(SlotState::Free as u8),
                data: UnsafeCell::new(data.into_boxed_slice()),
            });
        }

        let shared = Arc::new(Shared {
            slots: slots.into_boxed_slice(),
            slot_size,
            closed: CancelToken::new(),
        });

        let (free_tx, free_rx) = bounded(slot_count);
        let (ready_tx, ready_rx) = bounded(slot_count);
        for index in 0..slot_count {
            // Capacity equals slot_count, cannot fail
            let _ = free_tx.try_send(index);
        }

        log::debug!("RingBuffer: {} slots x {} bytes", slot_count, slot_size);

        Ok(Self {
            producer: Some(SlotProducer {
                shared: Arc::clone(&shared),
                free: free_rx,
                ready: ready_tx,
                held: None,
            }),
            consumer: Some(SlotConsumer {
                shared: Arc::clone(&shared),
                ready: ready_rx,
                free: free_tx,
                held: None,
            }),
            shared,
        })
    }

    /// Take the producer role; only one exists per buffer
    pub fn take_producer(&mut self) -> Result<SlotProducer> {
        self.producer
            .take()
            .ok_or_else(|| Error::ContractViolation("producer role already taken".into()))
    }

    /// Take the consumer role; only one exists per buffer
    pub fn take_consumer(&mut self) -> Result<SlotConsumer> {
        self.consumer
            .take()
            .ok_or_else(|| Error::ContractViolation("consumer role already taken".into()))
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    pub fn slot_state(&self, index: usize) -> Result<SlotState> {
        self.shared.state(index)
    }

    /// Number of committed slots not yet taken by the consumer
    pub fn ready_len(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|s| s.state.load(Ordering::Acquire) == SlotState::Ready as u8)
            .count()
    }

    /// Wake and disconnect both roles; later waits fail with `Disconnected`
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("slot_count", &self.slot_count())
            .field("slot_size", &self.slot_size())
            .field("ready", &self.ready_len())
            .finish()
    }
}

/// Block on `queue` until an index arrives, the timeout elapses, the
/// caller's token fires or the ring is closed.
fn wait_index(
    queue: &Receiver<usize>,
    shared: &Shared,
    timeout: Duration,
    cancel: &CancelToken,
    what: &'static str,
) -> Result<usize> {
    cancel.check()?;
    if shared.closed.is_cancelled() {
        return Err(Error::Disconnected);
    }
    crossbeam::select! {
        recv(queue) -> msg => msg.map_err(|_| Error::Disconnected),
        recv(cancel.signal()) -> _ => Err(Error::Cancelled),
        recv(shared.closed.signal()) -> _ => Err(Error::Disconnected),
        default(timeout) => Err(Error::Timeout(what)),
    }
}

/// Queue `index` for the other role
///
/// A dropped peer is not an error here: the slot already carries its new
/// state and nobody is left to take it. The surviving role learns about the
/// peer from `wait` once the queue it drains runs dry.
fn hand_over(queue: &Sender<usize>, index: usize) -> Result<()> {
    match queue.try_send(index) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => Ok(()),
        Err(TrySendError::Full(_)) => Err(Error::ContractViolation(format!(
            "slot queue full handing over slot {}",
            index
        ))),
    }
}

fn check_held(held: Option<usize>, index: usize, role: &str) -> Result<()> {
    match held {
        Some(h) if h == index => Ok(()),
        Some(h) => Err(Error::ContractViolation(format!(
            "{} holds slot {}, not slot {}",
            role, h, index
        ))),
        None => Err(Error::ContractViolation(format!(
            "{} does not hold slot {}",
            role, index
        ))),
    }
}

/// Writing side: reserves free slots and commits filled ones
pub struct SlotProducer {
    shared: Arc<Shared>,
    free: Receiver<usize>,
    ready: Sender<usize>,
    held: Option<usize>,
}

impl SlotProducer {
    /// Reserve the next free slot
    ///
    /// On `Timeout` or `Cancelled` no slot is reserved and the buffer is
    /// untouched; the call can simply be repeated.
    pub fn wait(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<usize> {
        if let Some(index) = self.held {
            return Err(Error::ContractViolation(format!(
                "producer already holds slot {}",
                index
            )));
        }
        let index = wait_index(&self.free, &self.shared, timeout, cancel, "free slot")?;
        self.shared.transition(index, SlotState::Free, SlotState::Producing)?;
        self.held = Some(index);
        Ok(index)
    }

    /// Writable view of a slot held by this producer
    pub fn slot_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        check_held(self.held, index, "producer")?;
        let slot = self.shared.check_index(index)?;
        // SAFETY: this producer holds `index` in the Producing state; no other
        // role can reach the slot until commit(), which needs `&mut self`.
        Ok(unsafe { &mut **slot.data.get() })
    }

    /// Publish a filled slot to the consumer
    pub fn commit(&mut self, index: usize) -> Result<()> {
        check_held(self.held, index, "producer")?;
        self.shared.transition(index, SlotState::Producing, SlotState::Ready)?;
        self.held = None;
        hand_over(&self.ready, index)
    }

    /// Slot currently reserved by this producer
    pub fn held(&self) -> Option<usize> {
        self.held
    }

    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }
}

/// Reading side: takes ready slots and releases them back to the pool
pub struct SlotConsumer {
    shared: Arc<Shared>,
    ready: Receiver<usize>,
    free: Sender<usize>,
    held: Option<usize>,
}

impl SlotConsumer {
    /// Take the oldest committed slot
    ///
    /// Never returns a slot the producer has not committed. On `Timeout` or
    /// `Cancelled` the buffer is untouched.
    pub fn wait(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<usize> {
        if let Some(index) = self.held {
            return Err(Error::ContractViolation(format!(
                "consumer already holds slot {}",
                index
            )));
        }
        let index = wait_index(&self.ready, &self.shared, timeout, cancel, "ready slot")?;
        self.shared.transition(index, SlotState::Ready, SlotState::Consuming)?;
        self.held = Some(index);
        Ok(index)
    }

    /// Read-only view of a slot held by this consumer
    pub fn slot(&self, index: usize) -> Result<&[u8]> {
        check_held(self.held, index, "consumer")?;
        let slot = self.shared.check_index(index)?;
        // SAFETY: this consumer holds `index` in the Consuming state; the
        // producer cannot reserve it again before release(), which needs
        // `&mut self`.
        Ok(unsafe { &**slot.data.get() })
    }

    /// Return a consumed slot to the free pool
    pub fn release(&mut self, index: usize) -> Result<()> {
        check_held(self.held, index, "consumer")?;
        self.shared.transition(index, SlotState::Consuming, SlotState::Free)?;
        self.held = None;
        hand_over(&self.free, index)
    }

    pub fn held(&self) -> Option<usize> {
        self.held
    }

    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(5);

    fn ring(slots: usize, size: usize) -> (RingBuffer, SlotProducer, SlotConsumer) {
        let mut ring = RingBuffer::new(slots, size).unwrap();
        let producer = ring.take_producer().unwrap();
        let consumer = ring.take_consumer().unwrap();
        (ring, producer, consumer)
    }

    #[test]
    fn test_geometry_validation() {
        assert!(matches!(RingBuffer::new(0, 16), Err(Error::InvalidArgument(_))));
        assert!(matches!(RingBuffer::new(4, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            RingBuffer::new(usize::MAX, 2),
            Err(Error::OutOfMemory { .. })
        ));
        assert!(matches!(
            RingBuffer::new(1, usize::MAX / 2),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_roles_taken_once() {
        let mut ring = RingBuffer::new(2, 8).unwrap();
        assert!(ring.take_producer().is_ok());
        assert!(matches!(ring.take_producer(), Err(Error::ContractViolation(_))));
        assert!(ring.take_consumer().is_ok());
        assert!(matches!(ring.take_consumer(), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn test_alternating_cycle() {
        let cancel = CancelToken::new();
        let (ring, mut producer, mut consumer) = ring(4, 8);

        for n in 0..10usize {
            let p = producer.wait(SHORT, &cancel).unwrap();
            assert_eq!(p, n % 4, "indices are handed out in FIFO order");
            assert_eq!(ring.slot_state(p).unwrap(), SlotState::Producing);
            producer.slot_mut(p).unwrap().fill(n as u8);
            producer.commit(p).unwrap();
            assert_eq!(ring.slot_state(p).unwrap(), SlotState::Ready);
            assert_eq!(ring.ready_len(), 1);

            let c = consumer.wait(SHORT, &cancel).unwrap();
            assert_eq!(c, p);
            assert_eq!(ring.slot_state(c).unwrap(), SlotState::Consuming);
            assert!(consumer.slot(c).unwrap().iter().all(|&b| b == n as u8));
            consumer.release(c).unwrap();
            assert_eq!(ring.slot_state(c).unwrap(), SlotState::Free);
        }
    }

    #[test]
    fn test_consumer_timeout_does_not_mutate() {
        let cancel = CancelToken::new();
        let (ring, mut producer, mut consumer) = ring(3, 4);

        // Reserved but never committed: consumer must not see it
        let p = producer.wait(SHORT, &cancel).unwrap();
        for _ in 0..5 {
            assert_eq!(consumer.wait(SHORT, &cancel), Err(Error::Timeout("ready slot")));
        }
        assert_eq!(consumer.held(), None);
        assert_eq!(ring.slot_state(p).unwrap(), SlotState::Producing);
        assert_eq!(ring.slot_state(1).unwrap(), SlotState::Free);
        assert_eq!(ring.ready_len(), 0);

        producer.commit(p).unwrap();
        assert_eq!(consumer.wait(SHORT, &cancel).unwrap(), p);
    }

    #[test]
    fn test_producer_timeout_when_full() {
        let cancel = CancelToken::new();
        let (ring, mut producer, _consumer) = ring(2, 4);

        for _ in 0..2 {
            let p = producer.wait(SHORT, &cancel).unwrap();
            producer.commit(p).unwrap();
        }
        assert_eq!(producer.wait(SHORT, &cancel), Err(Error::Timeout("free slot")));
        assert_eq!(producer.held(), None);
        assert_eq!(ring.ready_len(), 2);
    }

    #[test]
    fn test_single_reservation_per_role() {
        let cancel = CancelToken::new();
        let (_ring, mut producer, mut consumer) = ring(4, 4);

        let p = producer.wait(SHORT, &cancel).unwrap();
        assert!(matches!(producer.wait(SHORT, &cancel), Err(Error::ContractViolation(_))));
        producer.commit(p).unwrap();

        let c = consumer.wait(SHORT, &cancel).unwrap();
        assert!(matches!(consumer.wait(SHORT, &cancel), Err(Error::ContractViolation(_))));
        consumer.release(c).unwrap();
    }

    #[test]
    fn test_wrong_index_is_contract_violation() {
        let cancel = CancelToken::new();
        let (ring, mut producer, mut consumer) = ring(4, 4);

        assert!(matches!(producer.commit(0), Err(Error::ContractViolation(_))));
        assert!(matches!(producer.slot_mut(0), Err(Error::ContractViolation(_))));

        let p = producer.wait(SHORT, &cancel).unwrap();
        assert!(matches!(producer.commit(p + 1), Err(Error::ContractViolation(_))));
        assert!(matches!(producer.slot_mut(99), Err(Error::ContractViolation(_))));
        assert!(matches!(consumer.release(p), Err(Error::ContractViolation(_))));
        assert!(matches!(consumer.slot(p), Err(Error::ContractViolation(_))));
        assert!(matches!(ring.slot_state(99), Err(Error::ContractViolation(_))));

        // Failed calls left the reservation intact
        producer.commit(p).unwrap();
        let c = consumer.wait(SHORT, &cancel).unwrap();
        assert!(matches!(consumer.release(c + 1), Err(Error::ContractViolation(_))));
        consumer.release(c).unwrap();
    }

    #[test]
    fn test_cancelled_wait() {
        let cancel = CancelToken::new();
        let (ring, mut producer, mut consumer) = ring(2, 4);
        cancel.cancel();
        assert_eq!(producer.wait(SHORT, &cancel), Err(Error::Cancelled));
        assert_eq!(consumer.wait(SHORT, &cancel), Err(Error::Cancelled));
        assert_eq!(ring.slot_state(0).unwrap(), SlotState::Free);
    }

    #[test]
    fn test_cancel_wakes_blocked_consumer() {
        let cancel = CancelToken::new();
        let (_ring, _producer, mut consumer) = ring(2, 4);
        let waker = cancel.clone();

        let handle = std::thread::spawn(move || consumer.wait(Duration::from_secs(30), &cancel));
        std::thread::sleep(Duration::from_millis(20));
        waker.cancel();
        assert_eq!(handle.join().unwrap(), Err(Error::Cancelled));
    }

    #[test]
    fn test_close_disconnects_roles() {
        let cancel = CancelToken::new();
        let (ring, mut producer, mut consumer) = ring(2, 4);

        let handle = std::thread::spawn(move || consumer.wait(Duration::from_secs(30), &cancel));
        std::thread::sleep(Duration::from_millis(20));
        ring.close();
        assert!(ring.is_closed());
        assert_eq!(handle.join().unwrap(), Err(Error::Disconnected));
        assert_eq!(producer.wait(SHORT, &CancelToken::new()), Err(Error::Disconnected));
    }

    #[test]
    fn test_producer_outlives_consumer() {
        let cancel = CancelToken::new();
        let (ring, mut producer, consumer) = ring(2, 4);
        drop(consumer);

        // Free indices queued before the drop are still handed out and commit cleanly
        for _ in 0..2 {
            let p = producer.wait(SHORT, &cancel).unwrap();
            producer.commit(p).unwrap();
            assert_eq!(ring.slot_state(p).unwrap(), SlotState::Ready);
            assert_eq!(producer.held(), None);
        }
        assert_eq!(producer.wait(SHORT, &cancel), Err(Error::Disconnected));
    }

    #[test]
    fn test_consumer_drains_after_producer_exit() {
        let cancel = CancelToken::new();
        let (ring, mut producer, mut consumer) = ring(4, 2);

        for n in 0..3u8 {
            let p = producer.wait(SHORT, &cancel).unwrap();
            producer.slot_mut(p).unwrap().fill(n);
            producer.commit(p).unwrap();
        }
        drop(producer);

        for n in 0..3u8 {
            let c = consumer.wait(SHORT, &cancel).unwrap();
            assert_eq!(consumer.slot(c).unwrap(), &[n, n]);
            consumer.release(c).unwrap();
            assert_eq!(ring.slot_state(c).unwrap(), SlotState::Free);
            assert_eq!(consumer.held(), None);
        }
        assert_eq!(consumer.wait(SHORT, &cancel), Err(Error::Disconnected));
        assert_eq!(ring.ready_len(), 0);
    }

    #[test]
    fn test_threaded_fifo() {
        let cancel = CancelToken::new();
        let (_ring, mut producer, mut consumer) = ring(8, 8);
        let blocks = 2000u64;

        let producer_cancel = cancel.clone();
        let writer = std::thread::spawn(move || {
            for n in 0..blocks {
                let idx = producer.wait(Duration::from_secs(5), &producer_cancel).unwrap();
                producer.slot_mut(idx).unwrap().copy_from_slice(&n.to_le_bytes());
                producer.commit(idx).unwrap();
            }
        });

        let mut expected_index = 0usize;
        for n in 0..blocks {
            let idx = consumer.wait(Duration::from_secs(5), &cancel).unwrap();
            assert_eq!(idx, expected_index);
            let value = u64::from_le_bytes(consumer.slot(idx).unwrap().try_into().unwrap());
            assert_eq!(value, n);
            consumer.release(idx).unwrap();
            expected_index = (expected_index + 1) % 8;
        }
        writer.join().unwrap();
    }
}
