// src/reactor/event_loop.rs - Single-threaded UDP event loop
//
// Core features:
// - One OS thread serializes socket I/O, timers, and deferred tasks
// - Lock-free hand-off from any producer thread (crossbeam channels)
// - Self-pipe wakeup with coalescing (`signaled`)
// - Tiered backpressure on the outbound queue (Normal/Lagging/Overflown)
// - Posted tasks run inline when already on the loop thread
// - Shutdown drain: pending tasks still resolve after the cycle exits

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::clock::LoopClock;
use crate::error::{Error, Result};
use crate::reactor::backpressure::{BackpressureGate, BackpressureState};
use crate::reactor::poller;
use crate::reactor::task::{Task, TaskHandle};
use crate::reactor::timer::{Timer, TimerInner, TimerQueue};
use crate::reactor::wakeup::WakeChannel;
use crate::rtp::MTU;

/// Default outbound queue bound, overridable via `RTP_REACTOR_MAX_QUEUE`.
const DEFAULT_MAX_QUEUE: usize = 16 * 1024;

/// Sentinel for "no pending affinity request".
const NO_PENDING_CPU: i32 = i32::MIN;

/// Receiver of inbound datagrams.
///
/// Called on the loop thread, at most once per readable wakeup. The source
/// address is in host order by construction.
pub trait LoopListener: Send + Sync {
    fn on_read(&self, fd: RawFd, data: &[u8], from: SocketAddrV4);
}

/// One queued outbound datagram. Host-order destination; conversion to
/// network order happens at the syscall boundary.
struct SendBuffer {
    ip: Ipv4Addr,
    port: u16,
    payload: Bytes,
}

/// Receive buffer, 32-byte aligned.
#[repr(align(32))]
struct RecvBuffer([u8; MTU]);

pub(crate) struct LoopInner {
    running: AtomicBool,
    signaled: AtomicBool,
    /// Socket fd, -1 when the loop runs as a pure task executor.
    fd: AtomicI32,
    socket: Mutex<Option<UdpSocket>>,
    listener: Mutex<Option<Arc<dyn LoopListener>>>,
    thread_id: Mutex<Option<ThreadId>>,
    join: Mutex<Option<JoinHandle<()>>>,
    send_tx: Sender<SendBuffer>,
    send_rx: Receiver<SendBuffer>,
    task_tx: Sender<Task>,
    task_rx: Receiver<Task>,
    pub(crate) timers: Mutex<TimerQueue>,
    now_ms: AtomicU64,
    clock: LoopClock,
    gate: BackpressureGate,
    wake: WakeChannel,
    pending_cpu: AtomicI32,
}

/// Single-threaded UDP event loop.
///
/// Cloning yields another handle to the same loop; the spawned loop thread
/// holds one, so the loop lives until [`stop`](EventLoop::stop).
///
/// All callbacks — [`LoopListener::on_read`], timer callbacks, posted task
/// closures — execute on the loop thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Create a loop with the default outbound queue bound (16384 packets,
    /// overridable via the `RTP_REACTOR_MAX_QUEUE` environment variable).
    pub fn new() -> Result<Self> {
        Self::with_max_queue(env_max_queue())
    }

    /// Create a loop with an explicit outbound queue bound.
    pub fn with_max_queue(max_queue: usize) -> Result<Self> {
        let (send_tx, send_rx) = unbounded();
        let (task_tx, task_rx) = unbounded();
        let clock = LoopClock::new();
        let wake = WakeChannel::new()?;

        Ok(Self {
            inner: Arc::new(LoopInner {
                running: AtomicBool::new(false),
                signaled: AtomicBool::new(false),
                fd: AtomicI32::new(-1),
                socket: Mutex::new(None),
                listener: Mutex::new(None),
                thread_id: Mutex::new(None),
                join: Mutex::new(None),
                send_tx,
                send_rx,
                task_tx,
                task_rx,
                timers: Mutex::new(TimerQueue::new()),
                now_ms: AtomicU64::new(clock.now_ms()),
                clock,
                gate: BackpressureGate::new(max_queue),
                wake,
                pending_cpu: AtomicI32::new(NO_PENDING_CPU),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<LoopInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<LoopInner> {
        Arc::downgrade(&self.inner)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the loop thread on an already-bound UDP socket. The loop owns
    /// the socket from here until `stop`.
    pub fn start(
        &self,
        socket: UdpSocket,
        listener: Option<Arc<dyn LoopListener>>,
    ) -> Result<()> {
        self.begin_start()?;

        if let Err(e) = socket.set_nonblocking(true) {
            self.inner.running.store(false, Ordering::Release);
            return Err(e.into());
        }

        self.inner.fd.store(socket.as_raw_fd(), Ordering::Release);
        *self.inner.socket.lock() = Some(socket);
        *self.inner.listener.lock() = listener;

        info!(
            "Event loop starting with socket (max_queue: {})",
            self.inner.gate.max_queue()
        );
        self.spawn_loop_thread()
    }

    /// Start the loop thread with no socket: a pure timer/task executor.
    pub fn start_runner(&self) -> Result<()> {
        self.begin_start()?;
        info!("Event loop starting as task runner");
        self.spawn_loop_thread()
    }

    /// Start the loop thread running a caller-provided entry closure. The
    /// closure receives a handle clone and normally calls
    /// [`run`](EventLoop::run) after its own setup.
    pub fn start_with<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce(EventLoop) + Send + 'static,
    {
        self.begin_start()?;
        let lp = self.clone();
        let handle = thread::Builder::new()
            .name("rtp-reactor".to_string())
            .spawn(move || entry(lp))
            .map_err(|e| {
                self.inner.running.store(false, Ordering::Release);
                Error::Io(e)
            })?;
        *self.inner.join.lock() = Some(handle);
        Ok(())
    }

    fn begin_start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    fn spawn_loop_thread(&self) -> Result<()> {
        let lp = self.clone();
        let handle = thread::Builder::new()
            .name("rtp-reactor".to_string())
            .spawn(move || lp.run_cycle(None))
            .map_err(|e| {
                self.inner.running.store(false, Ordering::Release);
                Error::Io(e)
            })?;
        *self.inner.join.lock() = Some(handle);
        Ok(())
    }

    /// Drive the poll cycle on the calling thread until
    /// [`stop`](EventLoop::stop) or until `duration` elapses. Used by tests
    /// and by [`start_with`](EventLoop::start_with) entry closures.
    pub fn run(&self, duration: Option<Duration>) {
        self.inner.running.store(true, Ordering::Release);
        self.run_cycle(duration);
    }

    /// Stop the loop and join its thread. Idempotent; callable from any
    /// thread including the loop thread itself (join is skipped there).
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);

        // Wake the poll even if a signal is already pending; an undrained
        // signal means poll returns promptly anyway.
        self.inner.wake.notify();

        let handle = self.inner.join.lock().take();
        let mut joined = true;
        if let Some(handle) = handle {
            if thread::current().id() == handle.thread().id() {
                joined = false; // stopping from inside a callback
            } else {
                let _ = handle.join();
            }
        }

        self.inner.signaled.store(false, Ordering::Release);

        // Release the socket once no loop thread can still be using it.
        if joined {
            self.inner.fd.store(-1, Ordering::Release);
            *self.inner.socket.lock() = None;
            *self.inner.listener.lock() = None;
        }
    }

    /// True from `start*` until the cycle exits (stop or fatal poll event).
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Pin the loop thread to `cpu`, or to the full CPU set when negative.
    /// Before start the mask is applied by the loop thread as it comes up.
    pub fn set_affinity(&self, cpu: i32) -> Result<()> {
        let join = self.inner.join.lock();
        if let Some(handle) = join.as_ref() {
            affinity_on_thread(handle, cpu).map_err(Error::Affinity)
        } else {
            self.inner.pending_cpu.store(cpu, Ordering::Release);
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Cross-thread entry points
    // ------------------------------------------------------------------

    /// Enqueue a datagram for asynchronous send. Never blocks; under
    /// backpressure the packet is dropped (see [`BackpressureState`]).
    pub fn send(&self, ip: Ipv4Addr, port: u16, payload: Bytes) {
        if !self.inner.gate.admit(self.inner.send_tx.len()) {
            return;
        }
        let _ = self.inner.send_tx.send(SendBuffer { ip, port, payload });
        self.signal_wake();
    }

    /// Post a task onto the loop thread. Called from the loop thread the
    /// closure runs inline and the returned handle is already resolved.
    pub fn post<F>(&self, func: F) -> TaskHandle
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let (task, handle) = Task::new(func);
        if self.is_loop_thread() {
            task.run(self.now());
        } else {
            let _ = self.inner.task_tx.send(task);
            self.signal_wake();
        }
        handle
    }

    /// Create a detached (unscheduled) timer.
    pub fn create_timer<F>(&self, callback: F) -> Timer
    where
        F: FnMut(u64) + Send + 'static,
    {
        Timer {
            inner: Arc::new(TimerInner::new(self.downgrade(), 0, Box::new(callback))),
        }
    }

    /// Create a one-shot timer firing after `delay`.
    pub fn create_timer_once<F>(&self, delay: Duration, callback: F) -> Timer
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.create_timer_repeating(delay, Duration::ZERO, callback)
    }

    /// Create a timer firing after `delay` and then every `repeat`
    /// (`Duration::ZERO` repeat means one-shot). The fire time is fixed at
    /// call time; insertion happens on the loop thread so callers never
    /// race the timer index.
    pub fn create_timer_repeating<F>(
        &self,
        delay: Duration,
        repeat: Duration,
        callback: F,
    ) -> Timer
    where
        F: FnMut(u64) + Send + 'static,
    {
        let timer = Timer {
            inner: Arc::new(TimerInner::new(
                self.downgrade(),
                repeat.as_millis() as u64,
                Box::new(callback),
            )),
        };

        let next_ms = self.now() + delay.as_millis() as u64;
        let inner = self.inner.clone();
        let handle = timer.inner.clone();
        let _ = self.post(move |_| {
            inner.timers.lock().insert(next_ms, &handle);
        });

        timer
    }

    /// Cached loop-local monotonic time, ms since the Unix epoch. Refreshed
    /// at each poll wakeup.
    pub fn now(&self) -> u64 {
        self.inner.now_ms.load(Ordering::Relaxed)
    }

    /// Approximate outbound queue length (backpressure input).
    pub fn queue_len(&self) -> usize {
        self.inner.send_tx.len()
    }

    /// Current send-path congestion state.
    pub fn backpressure(&self) -> BackpressureState {
        self.inner.gate.state()
    }

    // ------------------------------------------------------------------
    // Loop internals
    // ------------------------------------------------------------------

    fn is_loop_thread(&self) -> bool {
        *self.inner.thread_id.lock() == Some(thread::current().id())
    }

    /// Wake the poll from another thread, coalescing repeat signals.
    fn signal_wake(&self) {
        if self.is_loop_thread() {
            return;
        }
        if self.inner.signaled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wake.notify();
    }

    fn refresh_now(&self) -> u64 {
        let now = self.inner.clock.now_ms();
        self.inner.now_ms.store(now, Ordering::Relaxed);
        now
    }

    /// The poll cycle. Runs on the loop thread until `running` clears, a
    /// fatal poll event occurs, or `duration` elapses; then drains the task
    /// queue one final time.
    fn run_cycle(&self, duration: Option<Duration>) {
        *self.inner.thread_id.lock() = Some(thread::current().id());

        let pending_cpu = self.inner.pending_cpu.swap(NO_PENDING_CPU, Ordering::AcqRel);
        if pending_cpu != NO_PENDING_CPU {
            if let Err(e) = affinity_on_self(pending_cpu) {
                warn!("Failed to apply pending thread affinity: {}", e);
            }
        }

        let listener = self.inner.listener.lock().clone();
        let mut recv_buf = RecvBuffer([0u8; MTU]);
        let mut pending: Option<SendBuffer> = None;

        let mut now = self.refresh_now();
        let until = duration.map(|d| now + d.as_millis() as u64);

        debug!("Event loop entering run cycle");

        while self.inner.running.load(Ordering::Acquire) && until.map_or(true, |u| now <= u) {
            let fd = self.inner.fd.load(Ordering::Acquire);
            let want_write = pending.is_some() || !self.inner.send_rx.is_empty();

            // Pending tasks poll with no wait; otherwise sleep until the
            // earliest of next timer and run deadline.
            let timeout = if !self.inner.task_rx.is_empty() {
                0
            } else {
                let mut deadline = self.inner.timers.lock().next_deadline();
                if let Some(u) = until {
                    deadline = Some(deadline.map_or(u, |d| d.min(u)));
                }
                match deadline {
                    Some(d) => d.saturating_sub(now).min(i32::MAX as u64) as i32,
                    None => -1,
                }
            };

            let report = match poller::wait(fd, self.inner.wake.read_fd(), want_write, timeout) {
                Ok(report) => report,
                Err(e) => {
                    error!("Poll failed, exiting loop: {}", e);
                    break;
                }
            };

            now = self.refresh_now();

            if report.socket.is_fatal() || report.wake.is_fatal() {
                warn!("Poll reported HUP/ERR, exiting loop");
                break;
            }

            // (1) Inbound datagram: one recv per wakeup.
            if report.socket.readable {
                match poller::recv_from(fd, &mut recv_buf.0) {
                    Ok((len, from)) => {
                        if let Some(listener) = listener.as_ref() {
                            listener.on_read(fd, &recv_buf.0[..len], from);
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => debug!("recvfrom failed: {}", e),
                }
            }

            // (2) Outbound drain. Under Normal state EAGAIN keeps the
            // in-flight item for the next writable wakeup; any other
            // outcome drops it and keeps draining.
            if report.socket.writable {
                let mut item = pending
                    .take()
                    .or_else(|| self.inner.send_rx.try_recv().ok());
                while let Some(buf) = item {
                    match poller::send_to(fd, &buf.payload, buf.ip, buf.port) {
                        Ok(_) => {
                            item = self.inner.send_rx.try_recv().ok();
                        }
                        Err(e) => {
                            let normal =
                                self.inner.gate.state() == BackpressureState::Normal;
                            if normal && e.kind() == io::ErrorKind::WouldBlock {
                                pending = Some(buf);
                                item = None;
                            } else {
                                debug!("sendto failed, dropping packet: {}", e);
                                item = self.inner.send_rx.try_recv().ok();
                            }
                        }
                    }
                }
            }

            // (3) Tasks, in arrival order.
            while let Ok(task) = self.inner.task_rx.try_recv() {
                task.run(now);
            }

            // (4) Due timers. Each fires with next_ms cleared; the repeat
            // is scheduled only if the callback did not reschedule itself.
            let due = self.inner.timers.lock().pop_due(now);
            for timer in due {
                timer.fire(now);
                let repeat = timer.repeat_ms();
                if repeat > 0 && timer.next_ms() == 0 {
                    self.inner.timers.lock().insert(now + repeat, &timer);
                }
            }

            // (5) Drain the wakeup and allow the next signal.
            if report.wake.readable {
                self.inner.wake.drain();
                self.inner.signaled.store(false, Ordering::Release);
            }

            now = self.refresh_now();
        }

        // Shutdown drain: posted tasks still resolve on this thread.
        while let Ok(task) = self.inner.task_rx.try_recv() {
            let now = self.refresh_now();
            task.run(now);
        }

        *self.inner.thread_id.lock() = None;
        self.inner.running.store(false, Ordering::Release);
        debug!("Event loop run cycle finished");
    }
}

fn env_max_queue() -> usize {
    std::env::var("RTP_REACTOR_MAX_QUEUE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_QUEUE)
}

// ----------------------------------------------------------------------
// CPU affinity
// ----------------------------------------------------------------------

/// Pin the calling thread: one CPU when `cpu >= 0`, the full set otherwise.
#[cfg(target_os = "linux")]
fn affinity_on_self(cpu: i32) -> io::Result<()> {
    // SAFETY: cpu_set_t is a plain bitmask for which all-zeroes is valid;
    // CPU_SET only touches bits within the set.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        fill_cpu_set(&mut set, cpu);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pin an already-running loop thread through its pthread handle.
#[cfg(target_os = "linux")]
fn affinity_on_thread(handle: &JoinHandle<()>, cpu: i32) -> io::Result<()> {
    use std::os::unix::thread::JoinHandleExt;

    // SAFETY: the pthread handle is valid while the JoinHandle is alive,
    // which the caller's lock on the join slot guarantees.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        fill_cpu_set(&mut set, cpu);
        let ret = libc::pthread_setaffinity_np(
            handle.as_pthread_t(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
unsafe fn fill_cpu_set(set: &mut libc::cpu_set_t, cpu: i32) {
    if cpu >= 0 {
        libc::CPU_SET(cpu as usize, set);
    } else {
        for j in 0..libc::CPU_SETSIZE as usize {
            libc::CPU_SET(j, set);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn affinity_on_self(cpu: i32) -> io::Result<()> {
    let _ = cpu;
    warn!("Thread affinity is not supported on this platform");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn affinity_on_thread(_handle: &JoinHandle<()>, cpu: i32) -> io::Result<()> {
    affinity_on_self(cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn new_loop() -> EventLoop {
        let _ = env_logger::builder().is_test(true).try_init();
        EventLoop::new().expect("event loop")
    }

    #[test]
    fn test_double_start_fails() {
        let lp = new_loop();
        lp.start_runner().expect("first start");
        assert!(matches!(lp.start_runner(), Err(Error::AlreadyRunning)));
        lp.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_quick() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        // The loop is idle (blocked in poll); stop must still join fast
        // thanks to the wakeup.
        let started = Instant::now();
        lp.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!lp.is_running());

        lp.stop(); // second stop is a no-op
    }

    #[test]
    fn test_restart_after_stop() {
        let lp = new_loop();
        lp.start_runner().expect("start");
        lp.stop();
        lp.start_runner().expect("restart");
        assert!(lp.is_running());
        lp.stop();
    }

    #[test]
    fn test_post_from_external_thread() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let handle = lp.post(move |now| {
            assert!(now > 0);
            ran2.store(true, Ordering::SeqCst);
        });

        handle.wait_timeout(Duration::from_secs(2)).expect("task");
        assert!(ran.load(Ordering::SeqCst));
        lp.stop();
    }

    #[test]
    fn test_post_inline_on_loop_thread() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let lp2 = lp.clone();
        let outer = lp.post(move |_| {
            // Already on the loop thread: this must complete before the
            // nested post returns.
            let inner = lp2.post(|_| {});
            assert!(inner.is_done());
            inner.wait().expect("inline task");
        });

        outer.wait_timeout(Duration::from_secs(2)).expect("outer task");
        lp.stop();
    }

    #[test]
    fn test_task_fifo_per_thread() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut last = None;
        for i in 0..10 {
            let order = order.clone();
            last = Some(lp.post(move |_| order.lock().push(i)));
        }
        last.unwrap().wait_timeout(Duration::from_secs(2)).expect("last task");

        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
        lp.stop();
    }

    #[test]
    fn test_task_panic_keeps_loop_alive() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let bad = lp.post(|_| panic!("task goes boom"));
        assert!(matches!(
            bad.wait_timeout(Duration::from_secs(2)),
            Err(Error::TaskPanicked)
        ));

        // The loop survived and still runs tasks.
        let good = lp.post(|_| {});
        good.wait_timeout(Duration::from_secs(2)).expect("next task");
        lp.stop();
    }

    #[test]
    fn test_shutdown_drain_runs_queued_tasks() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let ran = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let ran = ran.clone();
            handles.push(lp.post(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        lp.stop();

        for handle in handles {
            handle.wait_timeout(Duration::from_secs(1)).expect("drained task");
        }
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_repeating_timer_fires() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _timer = lp.create_timer_repeating(
            Duration::from_millis(50),
            Duration::from_millis(100),
            move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
        );

        thread::sleep(Duration::from_millis(380));
        lp.stop();

        // Nominal fires at 50/150/250/350ms; allow scheduling slack.
        let count = fired.load(Ordering::SeqCst);
        assert!((3..=5).contains(&count), "fired {} times", count);
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _timer = lp.create_timer_once(Duration::from_millis(30), move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(200));
        lp.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_cancel() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timer = lp.create_timer_once(Duration::from_millis(80), move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        thread::sleep(Duration::from_millis(200));
        lp.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_scheduled());
    }

    #[test]
    fn test_timer_again_from_inside_callback() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let fired = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));

        let fired2 = fired.clone();
        let slot2 = slot.clone();
        let timer = lp.create_timer(move |_| {
            let n = fired2.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // Reschedule from inside the callback; the loop must not
                // double-fire this tick.
                if let Some(timer) = slot2.lock().as_ref() {
                    timer.again(Duration::from_millis(40));
                }
            }
        });
        *slot.lock() = Some(timer.clone());

        timer.again(Duration::from_millis(30));
        thread::sleep(Duration::from_millis(250));
        lp.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_bounded_duration_drives_timers() {
        let lp = new_loop();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _timer = lp.create_timer_repeating(
            Duration::from_millis(50),
            Duration::from_millis(100),
            move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Drive inline on this thread for ~380ms.
        let started = Instant::now();
        lp.run(Some(Duration::from_millis(380)));
        assert!(started.elapsed() >= Duration::from_millis(370));

        let count = fired.load(Ordering::SeqCst);
        assert!((3..=5).contains(&count), "fired {} times", count);
    }

    #[test]
    fn test_udp_send_reaches_peer_in_order() {
        let peer = UdpSocket::bind("127.0.0.1:0").expect("peer bind");
        peer.set_read_timeout(Some(Duration::from_millis(500)))
            .expect("peer timeout");
        let peer_port = peer.local_addr().expect("peer addr").port();

        let socket = UdpSocket::bind("127.0.0.1:0").expect("loop bind");
        let lp = new_loop();
        lp.start(socket, None).expect("start");

        lp.send(Ipv4Addr::LOCALHOST, peer_port, Bytes::from_static(b"HELLO"));
        lp.send(Ipv4Addr::LOCALHOST, peer_port, Bytes::from_static(b"WORLD"));

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).expect("first datagram");
        assert_eq!(&buf[..len], b"HELLO");
        let (len, _) = peer.recv_from(&mut buf).expect("second datagram");
        assert_eq!(&buf[..len], b"WORLD");

        lp.stop();
    }

    #[test]
    fn test_on_read_delivers_datagram_and_source() {
        struct Recorder {
            tx: Sender<(Vec<u8>, SocketAddrV4)>,
        }
        impl LoopListener for Recorder {
            fn on_read(&self, _fd: RawFd, data: &[u8], from: SocketAddrV4) {
                let _ = self.tx.send((data.to_vec(), from));
            }
        }

        let socket = UdpSocket::bind("127.0.0.1:0").expect("loop bind");
        let loop_port = socket.local_addr().expect("loop addr").port();

        let (tx, rx) = unbounded();
        let lp = new_loop();
        lp.start(socket, Some(Arc::new(Recorder { tx }))).expect("start");

        let sender = UdpSocket::bind("127.0.0.1:0").expect("sender bind");
        sender
            .send_to(b"ping", ("127.0.0.1", loop_port))
            .expect("send");

        let (data, from) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("datagram delivered");
        assert_eq!(data, b"ping");
        assert_eq!(*from.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(from.port(), sender.local_addr().expect("sender addr").port());

        lp.stop();
    }

    #[test]
    fn test_send_backpressure_drops_past_high_watermark() {
        // No consumer: the queue only grows.
        let lp = EventLoop::with_max_queue(8).expect("event loop");
        for _ in 0..20 {
            lp.send(Ipv4Addr::LOCALHOST, 9, Bytes::from_static(b"x"));
        }

        // Admission stops once the length exceeds the bound.
        assert_eq!(lp.queue_len(), 9);
        assert_eq!(lp.backpressure(), BackpressureState::Overflown);
    }

    #[test]
    fn test_now_advances_while_running() {
        let lp = new_loop();
        lp.start_runner().expect("start");

        let before = lp.now();
        thread::sleep(Duration::from_millis(50));
        // Post a task to force a wakeup and clock refresh.
        lp.post(|_| {}).wait_timeout(Duration::from_secs(2)).expect("task");
        assert!(lp.now() >= before + 40);
        lp.stop();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_set_affinity_full_set() {
        let lp = new_loop();
        lp.start_runner().expect("start");
        lp.set_affinity(-1).expect("affinity");
        lp.stop();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_set_affinity_before_start() {
        let lp = new_loop();
        lp.set_affinity(0).expect("pending affinity");
        lp.start_runner().expect("start");
        lp.post(|_| {}).wait_timeout(Duration::from_secs(2)).expect("task");
        lp.stop();
    }
}
