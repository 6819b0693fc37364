//! One child command running inside a pseudo-terminal.
//!
//! The child's output feeds a VT parser guarded by a single mutex; a reader
//! thread applies bytes under the lock and publishes a generation tick after
//! releasing it, a writer thread drains a bounded queue into the PTY master.
//! Any number of UI subscribers follow the generation channel; it is lossy,
//! only the latest tick matters.

mod frame;

pub use frame::{Cell, Color, Frame};

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::Command;
use crate::error::{Error, Result};

/// Rows of history kept per process.
const SCROLLBACK_LINES: usize = 1000;

/// Read chunk size for the PTY master.
const READ_CHUNK: usize = 4096;

/// Bound on queued writes; a full queue blocks the writing caller.
const WRITE_QUEUE_DEPTH: usize = 64;

/// How long a TERM'd child gets before the hard kill.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Process lifecycle. Transitions are one-way:
/// `Starting → Running → {Exited, Killed, Crashed}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Exited(u32),
    Killed,
    Crashed(String),
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

/// Generation tick published on the watch channel. `done` and the final
/// generation move together so consumers can't observe the end without the
/// last frame.
#[derive(Debug, Clone, Copy)]
struct Tick {
    generation: u64,
    done: bool,
}

struct Shared {
    parser: Mutex<vt100::Parser>,
    status: Mutex<ProcessStatus>,
    ticks: watch::Sender<Tick>,
    killed: AtomicBool,
}

impl Shared {
    fn bump(&self) {
        self.ticks.send_modify(|tick| tick.generation += 1);
    }

    fn finish(&self) {
        self.ticks.send_modify(|tick| {
            tick.generation += 1;
            tick.done = true;
        });
    }

    fn status(&self) -> ProcessStatus {
        self.status.lock().unwrap().clone()
    }

    /// Apply a transition; terminal states are never overwritten.
    fn set_status(&self, next: ProcessStatus) {
        let mut status = self.status.lock().unwrap();
        if !status.is_terminal() {
            *status = next;
        }
    }
}

/// A command running in its own PTY.
///
/// Dropping the handle terminates the child, joins both I/O threads and
/// closes the PTY.
pub struct PtyProcess {
    command: Command,
    shared: Arc<Shared>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer_tx: Mutex<Option<SyncSender<Vec<u8>>>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Spawn `command.cmd` under `sh -c` in a PTY of `width`×`height` cells,
    /// working directory `command.cwd`.
    pub fn spawn(command: &Command, width: u16, height: u16) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(
                "terminal size must be non-zero".into(),
            ));
        }

        let pty = native_pty_system()
            .openpty(PtySize {
                rows: height,
                cols: width,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::ProcessSpawn(e.to_string()))?;

        let mut builder = CommandBuilder::new("sh");
        builder.arg("-c");
        builder.arg(&command.cmd);
        builder.cwd(&command.cwd);
        builder.env("TERM", "xterm-256color");

        let child = pty
            .slave
            .spawn_command(builder)
            .map_err(|e| Error::ProcessSpawn(e.to_string()))?;
        // Close our copy of the slave so the master sees EOF when the child
        // exits.
        drop(pty.slave);
        debug!(id = %command.id, cmd = %command.cmd, "spawned process");

        let reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| Error::ProcessSpawn(e.to_string()))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| Error::ProcessSpawn(e.to_string()))?;

        let (ticks, _) = watch::channel(Tick {
            generation: 0,
            done: false,
        });
        let shared = Arc::new(Shared {
            parser: Mutex::new(vt100::Parser::new(height, width, SCROLLBACK_LINES)),
            status: Mutex::new(ProcessStatus::Starting),
            ticks,
            killed: AtomicBool::new(false),
        });
        let child: Arc<Mutex<Box<dyn Child + Send + Sync>>> = Arc::new(Mutex::new(child));

        let reader_thread = {
            let shared = shared.clone();
            let child = child.clone();
            thread::Builder::new()
                .name("fnug-pty-read".into())
                .spawn(move || reader_loop(reader, &shared, &child))?
        };

        let (writer_tx, writer_rx) = sync_channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let writer_thread = thread::Builder::new()
            .name("fnug-pty-write".into())
            .spawn(move || writer_loop(&writer_rx, writer))?;

        shared.set_status(ProcessStatus::Running);

        Ok(Self {
            command: command.clone(),
            shared,
            child,
            master: Mutex::new(Some(pty.master)),
            writer_tx: Mutex::new(Some(writer_tx)),
            reader_thread: Mutex::new(Some(reader_thread)),
            writer_thread: Mutex::new(Some(writer_thread)),
        })
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The UI may only focus the terminal of interactive commands. The
    /// process itself never restricts writes.
    pub fn can_focus(&self) -> bool {
        self.command.interactive
    }

    /// Snapshot of the state machine.
    pub fn status(&self) -> ProcessStatus {
        self.shared.status()
    }

    /// Snapshot of the current screen.
    pub fn frame(&self) -> Frame {
        let generation = self.shared.ticks.borrow().generation;
        let status = self.shared.status();
        let mut parser = self.shared.parser.lock().unwrap();
        Frame::capture(&mut parser, generation, status)
    }

    /// Subscribe to rendered frames. The first pull returns the current
    /// frame; later pulls wait for the generation counter to advance and
    /// coalesce bursts. Ends once the process is finished and its final
    /// frame has been observed.
    pub fn output(&self) -> OutputStream {
        OutputStream {
            shared: self.shared.clone(),
            ticks: self.shared.ticks.subscribe(),
            primed: false,
        }
    }

    /// Queue bytes for the child's stdin, in order. Blocks while the queue
    /// is full; silently does nothing once the process has been killed.
    pub fn write(&self, bytes: &[u8]) {
        if let Some(tx) = self.writer_tx.lock().unwrap().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Resize the PTY and the parser together. Zero dimensions are rejected.
    pub fn resize(&self, width: u16, height: u16) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(
                "cannot resize terminal to zero dimension".into(),
            ));
        }

        // The parser lock serializes this against the reader thread.
        let mut parser = self.shared.parser.lock().unwrap();
        if let Some(master) = self.master.lock().unwrap().as_ref() {
            master
                .resize(PtySize {
                    rows: height,
                    cols: width,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| Error::ProcessIo(std::io::Error::other(e.to_string())))?;
        }
        parser.screen_mut().set_size(height, width);
        drop(parser);

        self.shared.bump();
        Ok(())
    }

    /// Move the viewport `delta` rows into history (negative toward the live
    /// screen), clamped to the available scrollback.
    pub fn scroll(&self, delta: isize) {
        let mut parser = self.shared.parser.lock().unwrap();
        let depth = frame::scrollback_depth(&mut parser) as isize;
        let current = parser.screen().scrollback() as isize;
        let target = (current + delta).clamp(0, depth);
        parser.screen_mut().set_scrollback(target as usize);
        drop(parser);

        self.shared.bump();
    }

    /// Absolute form of [`scroll`](Self::scroll); 0 tracks the live screen.
    pub fn set_scroll(&self, rows: usize) {
        let mut parser = self.shared.parser.lock().unwrap();
        // The parser clamps to the available history itself.
        parser.screen_mut().set_scrollback(rows);
        drop(parser);

        self.shared.bump();
    }

    /// Report a mouse click to the child, if it asked for mouse events.
    /// No-op when mouse reporting is off.
    pub fn click(&self, x: u16, y: u16) {
        use vt100::{MouseProtocolEncoding, MouseProtocolMode};

        let (mode, encoding) = {
            let parser = self.shared.parser.lock().unwrap();
            let screen = parser.screen();
            (screen.mouse_protocol_mode(), screen.mouse_protocol_encoding())
        };
        if mode == MouseProtocolMode::None {
            return;
        }

        let press_only = mode == MouseProtocolMode::Press;
        let sequence = match encoding {
            MouseProtocolEncoding::Sgr => {
                let mut seq = format!("\x1b[<0;{};{}M", x + 1, y + 1);
                if !press_only {
                    seq.push_str(&format!("\x1b[<0;{};{}m", x + 1, y + 1));
                }
                seq.into_bytes()
            }
            _ => {
                // Legacy X10 bytes are offset by 32 and capped at 223.
                let cx = 32 + (x + 1).min(223) as u8;
                let cy = 32 + (y + 1).min(223) as u8;
                let mut seq = vec![0x1b, b'[', b'M', 32, cx, cy];
                if !press_only {
                    // Button 3 encodes release.
                    seq.extend_from_slice(&[0x1b, b'[', b'M', 32 + 3, cx, cy]);
                }
                seq
            }
        };
        self.write(&sequence);
    }

    /// Reset screen and scrollback, and nudge the child to repaint.
    pub fn clear(&self) {
        {
            let mut parser = self.shared.parser.lock().unwrap();
            let (rows, cols) = parser.screen().size();
            *parser = vt100::Parser::new(rows, cols, SCROLLBACK_LINES);
        }
        self.shared.bump();
        self.write(b"\x0c");
    }

    /// Terminate the child (TERM, short grace, then KILL), close the PTY and
    /// join both threads. Idempotent. A child that already exited on its own
    /// keeps its `Exited` status.
    pub async fn kill(&self) {
        self.shared.killed.store(true, Ordering::SeqCst);

        let child = self.child.clone();
        let _ = tokio::task::spawn_blocking(move || terminate(&child)).await;

        self.teardown().await;
        self.shared.set_status(ProcessStatus::Killed);
    }

    async fn teardown(&self) {
        // Closing the queue stops the writer; dropping the master closes the
        // PTY once the reader is done with its clone.
        drop(self.writer_tx.lock().unwrap().take());
        drop(self.master.lock().unwrap().take());

        let reader = self.reader_thread.lock().unwrap().take();
        let writer = self.writer_thread.lock().unwrap().take();
        let _ = tokio::task::spawn_blocking(move || {
            if let Some(handle) = reader {
                let _ = handle.join();
            }
            if let Some(handle) = writer {
                let _ = handle.join();
            }
        })
        .await;
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.shared.killed.store(true, Ordering::SeqCst);
        terminate(&self.child);
        self.shared.set_status(ProcessStatus::Killed);

        drop(self.writer_tx.lock().unwrap().take());
        drop(self.master.lock().unwrap().take());
        if let Some(handle) = self.reader_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.writer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// TERM the child's process group, give it a grace period, then KILL.
fn terminate(child: &Arc<Mutex<Box<dyn Child + Send + Sync>>>) {
    let mut child = child.lock().unwrap();
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.process_id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        // The child leads the PTY session, so its pid is the group id.
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn reader_loop(
    mut reader: Box<dyn Read + Send>,
    shared: &Arc<Shared>,
    child: &Arc<Mutex<Box<dyn Child + Send + Sync>>>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "pty read");
                {
                    let mut parser = shared.parser.lock().unwrap();
                    parser.process(&buf[..n]);
                }
                // Publish only after the lock is released.
                shared.bump();
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Ptys report EIO instead of a clean EOF on some platforms
                // once the child is gone; only a live child makes this a
                // crash.
                let exited = matches!(child.lock().unwrap().try_wait(), Ok(Some(_)))
                    || shared.killed.load(Ordering::SeqCst);
                if exited {
                    break;
                }
                shared.set_status(ProcessStatus::Crashed(format!("read error: {e}")));
                shared.finish();
                return;
            }
        }
    }

    // Drained; reap the child and record how it went.
    let exit = child.lock().unwrap().wait();
    if shared.killed.load(Ordering::SeqCst) {
        shared.set_status(ProcessStatus::Killed);
    } else {
        match exit {
            Ok(status) => shared.set_status(ProcessStatus::Exited(status.exit_code())),
            Err(e) => shared.set_status(ProcessStatus::Crashed(format!("wait failed: {e}"))),
        }
    }
    shared.finish();
}

fn writer_loop(rx: &Receiver<Vec<u8>>, mut writer: Box<dyn Write + Send>) {
    while let Ok(bytes) = rx.recv() {
        if writer.write_all(&bytes).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}

/// Async frame stream for one process. Single consumer, cancel by drop.
pub struct OutputStream {
    shared: Arc<Shared>,
    ticks: watch::Receiver<Tick>,
    primed: bool,
}

impl OutputStream {
    /// Next frame, coalescing any ticks that arrived since the last pull.
    /// `None` once the process has finished and its final frame was seen.
    pub async fn next(&mut self) -> Option<Frame> {
        if self.primed {
            if !self.ticks.has_changed().ok()? {
                if self.ticks.borrow().done {
                    return None;
                }
                self.ticks.changed().await.ok()?;
            }
        } else {
            self.primed = true;
        }

        let tick = *self.ticks.borrow_and_update();
        let status = self.shared.status();
        let mut parser = self.shared.parser.lock().unwrap();
        Some(Frame::capture(&mut parser, tick.generation, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn command(cmd: &str, interactive: bool) -> Command {
        Command {
            id: "test".into(),
            name: "test".into(),
            cmd: cmd.into(),
            cwd: std::env::temp_dir(),
            interactive,
            auto: Default::default(),
        }
    }

    async fn wait_for<F>(process: &PtyProcess, mut pred: F) -> Frame
    where
        F: FnMut(&Frame) -> bool,
    {
        let mut output = process.output();
        timeout(WAIT, async {
            loop {
                let frame = output.next().await.expect("stream ended early");
                if pred(&frame) {
                    return frame;
                }
            }
        })
        .await
        .expect("condition not reached in time")
    }

    async fn wait_for_exit(process: &PtyProcess) {
        let mut output = process.output();
        timeout(WAIT, async {
            while let Some(_frame) = output.next().await {}
        })
        .await
        .expect("process did not finish in time");
    }

    #[test]
    fn zero_size_is_rejected() {
        let err = PtyProcess::spawn(&command("true", false), 0, 24).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn echoes_written_input() {
        let process = PtyProcess::spawn(&command("cat", true), 80, 24).unwrap();
        process.write(b"hello\n");

        let frame = wait_for(&process, |f| f.text().contains("hello")).await;
        assert!(frame.text().contains("hello"));

        process.kill().await;
        assert_eq!(process.status(), ProcessStatus::Killed);
        // Writes after kill are dropped silently.
        process.write(b"ignored");
    }

    #[tokio::test]
    async fn natural_exit_is_recorded_with_its_code() {
        let process = PtyProcess::spawn(&command("exit 3", false), 80, 24).unwrap();
        wait_for_exit(&process).await;
        assert_eq!(process.status(), ProcessStatus::Exited(3));

        // Killing an already-exited process keeps the exit status.
        process.kill().await;
        assert_eq!(process.status(), ProcessStatus::Exited(3));
    }

    #[tokio::test]
    async fn generations_increase_monotonically() {
        let process = PtyProcess::spawn(&command("seq 50", false), 80, 24).unwrap();
        let mut output = process.output();
        let mut last = None;
        while let Some(frame) = timeout(WAIT, output.next()).await.unwrap() {
            if let Some(prev) = last {
                assert!(frame.generation > prev, "{} !> {prev}", frame.generation);
            }
            last = Some(frame.generation);
        }
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn final_frame_carries_terminal_status() {
        let process = PtyProcess::spawn(&command("true", false), 80, 24).unwrap();
        let mut output = process.output();
        let mut frames = Vec::new();
        while let Some(frame) = timeout(WAIT, output.next()).await.unwrap() {
            frames.push(frame);
        }
        let last = frames.last().expect("at least one frame");
        assert!(last.status.is_terminal(), "{:?}", last.status);
    }

    #[tokio::test]
    async fn scrollback_survives_resize() {
        let process = PtyProcess::spawn(&command("seq 500", false), 80, 24).unwrap();
        wait_for_exit(&process).await;

        let before = process.frame();
        assert!(before.scrollback >= 500 - 24, "{}", before.scrollback);

        process.set_scroll(500);
        process.resize(80, 50).unwrap();

        let after = process.frame();
        assert!(after.scrollback >= 500 - 50, "{}", after.scrollback);
    }

    #[tokio::test]
    async fn scroll_clamps_to_history() {
        let process = PtyProcess::spawn(&command("seq 100", false), 80, 24).unwrap();
        wait_for_exit(&process).await;

        // Well past the oldest row: clamped to the depth, not beyond.
        process.scroll(100_000);
        let frame = process.frame();
        assert!(frame.text().contains('1'), "oldest rows visible");

        // And back down past zero.
        process.scroll(-1_000_000);
        let frame = process.frame();
        assert!(frame.text().contains("100"), "{}", frame.text());
    }

    #[tokio::test]
    async fn clear_resets_screen_and_scrollback() {
        let process = PtyProcess::spawn(&command("seq 100; sleep 5", false), 80, 24).unwrap();
        let _ = wait_for(&process, |f| f.text().contains("100")).await;

        process.clear();
        let frame = process.frame();
        assert_eq!(frame.scrollback, 0);
        assert!(!frame.text().contains("99"), "{}", frame.text());

        process.kill().await;
        assert_eq!(process.status(), ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let process = PtyProcess::spawn(&command("sleep 30", false), 80, 24).unwrap();
        process.kill().await;
        process.kill().await;
        assert_eq!(process.status(), ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn resize_rejects_zero_dimensions() {
        let process = PtyProcess::spawn(&command("sleep 5", false), 80, 24).unwrap();
        assert!(process.resize(0, 24).is_err());
        assert!(process.resize(80, 0).is_err());
        process.kill().await;
    }

    #[test]
    fn focus_follows_the_interactive_flag() {
        let interactive = PtyProcess::spawn(&command("sleep 1", true), 80, 24).unwrap();
        assert!(interactive.can_focus());
        let plain = PtyProcess::spawn(&command("sleep 1", false), 80, 24).unwrap();
        assert!(!plain.can_focus());
    }

    #[tokio::test]
    async fn click_is_silent_without_mouse_reporting() {
        let process = PtyProcess::spawn(&command("cat", true), 80, 24).unwrap();
        // cat never enables mouse reporting; nothing must reach it.
        process.click(3, 4);
        process.write(b"marker\n");
        let frame = wait_for(&process, |f| f.text().contains("marker")).await;
        assert!(!frame.text().contains("\u{1b}"));
        process.kill().await;
    }
}
