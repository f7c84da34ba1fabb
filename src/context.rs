//! Engine core and user-visible facade.
//!
//! A [`Context`] owns the USB backend, the driver registry and the live
//! channel table, and runs the unified event loop: one `poll(2)` over the
//! descriptors channels are waiting on (plus any backend descriptors),
//! one backend event pass, deferred pump dispatch, and the quarantine
//! sweep that destroys channels once their cancellations have completed.
//!
//! Channels live in a generational slab guarded by a reader/writer lock;
//! each slot carries its own mutex so the event loop can dispatch under
//! the shared lock while facade calls from other threads inspect channels
//! safely. The sweep upgrades to the exclusive lock only when there is
//! something to destroy.

use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::backend::nusb::NusbBackend;
use crate::backend::{ChannelKey, Completion, DeviceDesc, UsbBackend};
use crate::channel::{borrow_fd, fd_is_valid, make_pipe_pair, FileChannel};
use crate::driver::DriverRegistry;
use crate::error::{Error, Result};
use crate::types::{Channel, DeviceRef, LineParams, Status};

/// A descriptor a channel is waiting on.
pub(crate) struct PollEntry {
    pub(crate) fd: RawFd,
    pub(crate) events: PollFlags,
}

/// Event-loop state shared with channels: the poll-list of parked
/// descriptors, the pending-delete list, and the "something to dispatch"
/// flag.
#[derive(Default)]
pub(crate) struct Reactor {
    pub(crate) poll_list: Mutex<Vec<PollEntry>>,
    pub(crate) delete_list: Mutex<Vec<ChannelKey>>,
    pub(crate) pending: AtomicBool,
}

impl Reactor {
    /// Park a descriptor until `poll(2)` reports it ready. Duplicates are
    /// rejected.
    pub(crate) fn poll_request(&self, fd: RawFd, events: PollFlags) {
        let mut list = self.poll_list.lock();
        if list.iter().any(|e| e.fd == fd) {
            warn!("fd {fd} already on the poll list");
            return;
        }
        list.push(PollEntry { fd, events });
    }

    /// Queue a channel for destruction. Idempotent.
    pub(crate) fn request_removal(&self, key: ChannelKey) {
        let mut list = self.delete_list.lock();
        if !list.contains(&key) {
            list.push(key);
        }
    }
}

enum SlotState {
    Free,
    /// Key handed out, channel not constructed yet.
    Reserved,
    Live(Mutex<FileChannel>),
}

struct Slot {
    gen: u32,
    state: SlotState,
}

/// Generational slab of channels. Keys of vacated slots never resolve
/// again; transfer completions carrying a stale key are dropped instead of
/// reaching a recycled channel.
pub(crate) struct ChannelTable {
    slots: Vec<Slot>,
}

impl ChannelTable {
    fn new() -> Self {
        ChannelTable { slots: Vec::new() }
    }

    /// Claim a slot and hand out its key; the channel is installed with
    /// [`fill`](Self::fill) or the slot returned with
    /// [`release`](Self::release).
    fn reserve(&mut self) -> ChannelKey {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot.state, SlotState::Free) {
                slot.state = SlotState::Reserved;
                return ChannelKey {
                    index: index as u32,
                    gen: slot.gen,
                };
            }
        }
        self.slots.push(Slot {
            gen: 1,
            state: SlotState::Reserved,
        });
        ChannelKey {
            index: (self.slots.len() - 1) as u32,
            gen: 1,
        }
    }

    fn fill(&mut self, key: ChannelKey, channel: FileChannel) {
        let slot = &mut self.slots[key.index as usize];
        debug_assert!(slot.gen == key.gen && matches!(slot.state, SlotState::Reserved));
        slot.state = SlotState::Live(Mutex::new(channel));
    }

    fn release(&mut self, key: ChannelKey) {
        let slot = &mut self.slots[key.index as usize];
        if slot.gen == key.gen {
            slot.gen = slot.gen.wrapping_add(1);
            slot.state = SlotState::Free;
        }
    }

    fn get(&self, key: ChannelKey) -> Option<&Mutex<FileChannel>> {
        let slot = self.slots.get(key.index as usize)?;
        match &slot.state {
            SlotState::Live(cell) if slot.gen == key.gen => Some(cell),
            _ => None,
        }
    }

    fn remove(&mut self, key: ChannelKey) -> Option<FileChannel> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.gen != key.gen || !matches!(slot.state, SlotState::Live(_)) {
            return None;
        }
        slot.gen = slot.gen.wrapping_add(1);
        match std::mem::replace(&mut slot.state, SlotState::Free) {
            SlotState::Live(cell) => Some(cell.into_inner()),
            _ => None,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (ChannelKey, &Mutex<FileChannel>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            if let SlotState::Live(cell) = &slot.state {
                Some((
                    ChannelKey {
                        index: index as u32,
                        gen: slot.gen,
                    },
                    cell,
                ))
            } else {
                None
            }
        })
    }

    fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Live(_)))
            .count()
    }
}

/// The engine facade.
///
/// One `Context` binds devices to descriptor pairs and pumps them for as
/// long as one thread keeps calling [`run_once`](Self::run_once). The
/// other methods may be called concurrently from any thread.
pub struct Context {
    backend: Box<dyn UsbBackend>,
    registry: DriverRegistry,
    channels: RwLock<ChannelTable>,
    reactor: Reactor,
}

impl Context {
    /// A context over the native USB stack, with the stock drivers
    /// registered.
    pub fn new() -> Self {
        Self::with_backend(Box::new(NusbBackend::new()))
    }

    /// A context over a caller-supplied backend. The stock drivers are
    /// registered; [`registry`](Self::registry) can amend the set.
    pub fn with_backend(backend: Box<dyn UsbBackend>) -> Self {
        Context {
            backend,
            registry: DriverRegistry::with_stock_drivers(),
            channels: RwLock::new(ChannelTable::new()),
            reactor: Reactor::default(),
        }
    }

    /// The driver registry used for device probing.
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Set the logging threshold. A plain atomic store.
    pub fn set_log_level(level: log::LevelFilter) {
        log::set_max_level(level);
    }

    /// Bind a device to an existing descriptor pair.
    pub fn attach(
        &self,
        dev: impl Into<DeviceRef>,
        ch: Channel,
        line: &LineParams,
    ) -> Result<()> {
        validate_line(line)?;
        validate_channel(&ch)?;
        self.do_attach(dev.into(), ch, ch, Vec::new(), line)
    }

    /// Bind a device to a fresh pair of pipes and return the caller-side
    /// ends. The engine owns all four pipe ends and closes them when the
    /// channel is destroyed.
    pub fn pipe(&self, dev: impl Into<DeviceRef>, line: &LineParams) -> Result<Channel> {
        validate_line(line)?;
        let (io, visible, owned) = make_pipe_pair()?;
        self.do_attach(dev.into(), io, visible, owned, line)?;
        Ok(visible)
    }

    /// Detach the channel matching either descriptor of `ch`. In-flight
    /// transfers are cancelled; destruction happens in a later
    /// [`run_once`](Self::run_once) pass once they have quiesced.
    /// Idempotent; closing an unknown channel is a no-op.
    pub fn close(&self, ch: Channel) {
        let table = self.channels.read();
        let deleted = self.reactor.delete_list.lock().clone();
        for (key, cell) in table.iter() {
            if deleted.contains(&key) {
                continue;
            }
            let mut chan = cell.lock();
            if chan.matches(ch) {
                chan.close();
                self.reactor.request_removal(key);
                return;
            }
        }
    }

    /// Reset the device behind a channel.
    pub fn reset(&self, ch: Channel) -> Result<()> {
        self.with_channel(ch, |chan| chan.reset())
    }

    /// Send an RS-232 break on a channel.
    pub fn send_break(&self, ch: Channel) -> Result<()> {
        self.with_channel(ch, |chan| chan.send_break())
    }

    /// Health and line-error bits for a channel.
    pub fn status(&self, ch: Channel) -> Result<Status> {
        self.with_channel(ch, |chan| Ok(chan.status()))
    }

    fn with_channel<T>(
        &self,
        ch: Channel,
        f: impl FnOnce(&mut FileChannel) -> Result<T>,
    ) -> Result<T> {
        let table = self.channels.read();
        let deleted = self.reactor.delete_list.lock().clone();
        for (key, cell) in table.iter() {
            if deleted.contains(&key) {
                continue;
            }
            let mut chan = cell.lock();
            if chan.matches(ch) {
                return f(&mut chan);
            }
        }
        Err(Error::NoChannel)
    }

    fn find_device(&self, dev: &DeviceRef) -> Result<DeviceDesc> {
        let list = self.backend.devices()?;
        let found = match dev {
            DeviceRef::Id(id) => list
                .into_iter()
                .find(|d| d.vid == id.vid && d.pid == id.pid),
            DeviceRef::Addr(a) => list
                .into_iter()
                .find(|d| d.bus == a.bus && d.addr == a.addr),
        };
        if let Some(d) = &found {
            info!("found {:03}/{:03}", d.bus, d.addr);
        }
        found.ok_or(Error::NoDevice)
    }

    fn do_attach(
        &self,
        dev: DeviceRef,
        io: Channel,
        visible: Channel,
        owned: Vec<OwnedFd>,
        line: &LineParams,
    ) -> Result<()> {
        let desc = self.find_device(&dev)?;
        let handle = self.backend.open(&desc)?;
        let mut driver = self.registry.create(&handle, dev.interface())?;
        driver.setup(line)?;
        info!("channel {{{}, {}}}", io.fd_read, io.fd_write);

        let mut table = self.channels.write();
        let key = table.reserve();
        let built = FileChannel::new(key, handle, driver, io, visible, owned).and_then(
            |mut channel| {
                channel.init(&self.reactor)?;
                Ok(channel)
            },
        );
        match built {
            Ok(channel) => {
                table.fill(key, channel);
                Ok(())
            }
            Err(err) => {
                table.release(key);
                Err(err)
            }
        }
    }

    /// Run one event-loop iteration, waiting at most `timeout` for
    /// descriptor readiness or USB activity. Returns the number of live
    /// channels; once it reaches zero the caller may stop looping.
    pub fn run_once(&self, timeout: Duration) -> Result<usize> {
        let mut ready: Vec<(RawFd, PollFlags)> = Vec::new();
        let mut polled = false;
        {
            let mut saved = self.reactor.poll_list.lock();
            let backend_fds = self.backend.poll_fds();
            if !saved.is_empty() || !backend_fds.is_empty() {
                polled = true;
                let mut fds: Vec<PollFd> = saved
                    .iter()
                    .map(|e| PollFd::new(borrow_fd(e.fd), e.events))
                    .collect();
                fds.extend(
                    backend_fds
                        .iter()
                        .map(|(fd, events)| PollFd::new(borrow_fd(*fd), *events)),
                );
                let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
                match poll(&mut fds, PollTimeout::from(ms)) {
                    Ok(n) if n > 0 => {
                        for (i, pfd) in fds.iter().enumerate().take(saved.len()) {
                            let revents = pfd.revents().unwrap_or(PollFlags::empty());
                            if !revents.is_empty() {
                                ready.push((saved[i].fd, revents));
                            }
                        }
                        saved.retain(|e| !ready.iter().any(|(fd, _)| *fd == e.fd));
                    }
                    Ok(_) => {}
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                    Err(Errno::EINVAL) => return Err(Error::Poll),
                    Err(Errno::EBUSY) => return Err(Error::InterfaceBusy),
                    Err(Errno::EACCES) => return Err(Error::NoAccess),
                    Err(err) => {
                        error!("poll failed: {err}");
                        return Err(Error::Io(err));
                    }
                }
            }
        }

        let table = self.channels.upgradable_read();

        if !ready.is_empty() {
            let deleted = self.reactor.delete_list.lock().clone();
            for (fd, revents) in &ready {
                let mut routed = false;
                for (key, cell) in table.iter() {
                    if deleted.contains(&key) {
                        continue;
                    }
                    let mut chan = cell.lock();
                    if !chan.owns_fd(*fd) {
                        continue;
                    }
                    let read_side = chan.io_fds().0 == *fd;
                    chan.set_events(*revents, read_side, &self.reactor);
                    self.reactor.pending.store(true, Ordering::SeqCst);
                    routed = true;
                    break;
                }
                if !routed {
                    debug!("polled fd {fd} has no owning channel");
                }
            }
        }

        // One backend event pass per iteration. If poll(2) already spent
        // the wait (or found work), only drain what has completed.
        let usb_wait = if polled { Duration::ZERO } else { timeout };
        let completions = self.backend.handle_events(usb_wait)?;
        self.route_completions(&table, completions);

        if self.reactor.pending.swap(false, Ordering::SeqCst) {
            let deleted = self.reactor.delete_list.lock().clone();
            for (key, cell) in table.iter() {
                if deleted.contains(&key) {
                    continue;
                }
                cell.lock().events(&self.reactor);
            }
        }

        if !self.reactor.delete_list.lock().is_empty() {
            // Give outstanding cancellations one more chance to complete,
            // then sweep whatever has quiesced.
            let completions = self.backend.handle_events(usb_wait)?;
            self.route_completions(&table, completions);

            let mut table = RwLockUpgradableReadGuard::upgrade(table);
            let mut deleted = self.reactor.delete_list.lock();
            deleted.retain(|&key| {
                let busy = match table.get(key) {
                    Some(cell) => cell.lock().busy(),
                    None => return false,
                };
                if busy {
                    info!("busy channel skips cleanup");
                    return true;
                }
                if let Some(mut channel) = table.remove(key) {
                    let (fd_read, fd_write) = channel.io_fds();
                    self.reactor
                        .poll_list
                        .lock()
                        .retain(|e| e.fd != fd_read && e.fd != fd_write);
                    channel.close();
                }
                false
            });
            let pending_deletes = deleted.len();
            drop(deleted);
            Ok(table.live_count() - pending_deletes)
        } else {
            Ok(table.live_count())
        }
    }

    fn route_completions(&self, table: &ChannelTable, completions: Vec<Completion>) {
        for completion in completions {
            match table.get(completion.token.channel) {
                Some(cell) => cell.lock().on_completion(
                    completion.token.role,
                    completion.status,
                    completion.buffer,
                    completion.actual_len,
                    &self.reactor,
                ),
                None => debug!("completion for a destroyed channel"),
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        {
            let table = self.channels.read();
            for (key, cell) in table.iter() {
                cell.lock().close();
                self.reactor.request_removal(key);
            }
        }
        // Escalating drain passes let asynchronous cancellations land
        // before the backend goes away.
        for attempt in 1..=5u64 {
            if self.reactor.delete_list.lock().is_empty() {
                break;
            }
            let _ = self.run_once(Duration::from_millis(100 * attempt));
        }
    }
}

fn validate_line(line: &LineParams) -> Result<()> {
    if line.databits < 5 || line.databits > 9 {
        return Err(Error::InvalidParam("databits"));
    }
    if line.baudrate == 0 {
        return Err(Error::InvalidParam("baudrate"));
    }
    Ok(())
}

fn validate_channel(ch: &Channel) -> Result<()> {
    if !fd_is_valid(ch.fd_read) {
        return Err(Error::InvalidParam("fd_read"));
    }
    if !fd_is_valid(ch.fd_write) {
        return Err(Error::InvalidParam("fd_write"));
    }
    Ok(())
}
