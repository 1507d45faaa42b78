//! GPS message bus and connection supervisor.
//!
//! The actual network client is a collaborator behind [`GpsTransport`];
//! this module owns the notify bus and the two timers: a read timeout
//! that reports `NoData` when no packet arrived for 5 seconds, and a
//! periodic reconnect while the link is down.

use std::rc::Rc;

use log::info;

use crate::shell::{Shell, TimerId, TimerOutcome};

/// Read timeout after the last packet.
pub const GPS_READ_TIMEOUT_MS: u64 = 5000;
/// Default reconnect period while disconnected.
pub const GPS_RECONNECT_DELAY_MS: u64 = 10_000;

/// GPS fix quality, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GpsMode {
    NotSeen,
    NoFix,
    Fix2d,
    Fix3d,
}

/// One position report.
#[derive(Debug, Clone, Copy)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub mode: GpsMode,
    /// Reported position error in meters.
    pub epx: f64,
    pub epy: f64,
}

/// Messages broadcast on the bus.
#[derive(Debug, Clone, Copy)]
pub enum GpsMsg {
    Connected,
    Disconnected,
    /// Connected, but nothing received within the read timeout.
    NoData,
    Fix(GpsFix),
}

/// Subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubId(u32);

/// The network side of the GPS link, implemented by the host.
pub trait GpsTransport {
    /// Try to open the connection; returns whether it is up.
    fn connect(&mut self) -> bool;

    fn disconnect(&mut self);
}

type Subscriber = Box<dyn FnMut(&GpsMsg)>;

/// Connection supervisor and notify bus.
pub struct GpsLink {
    transport: Box<dyn GpsTransport>,
    shell: Rc<dyn Shell>,
    connected: bool,
    /// 0 disables automatic reconnection.
    reconnect_delay_ms: u64,
    subscribers: Vec<(SubId, Subscriber)>,
    next_sub: u32,
}

impl GpsLink {
    pub fn new(transport: Box<dyn GpsTransport>, shell: Rc<dyn Shell>) -> Self {
        Self {
            transport,
            shell,
            connected: false,
            reconnect_delay_ms: GPS_RECONNECT_DELAY_MS,
            subscribers: Vec::new(),
            next_sub: 0,
        }
    }

    /// Change the reconnect period; 0 disables reconnection.
    pub fn set_reconnect_delay_ms(&mut self, ms: u64) {
        self.reconnect_delay_ms = ms;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Subscribe to bus messages. The current connection state is
    /// reported to the new subscriber immediately.
    pub fn subscribe(&mut self, mut cb: Subscriber) -> SubId {
        let id = SubId(self.next_sub);
        self.next_sub += 1;

        let msg = if self.connected {
            GpsMsg::Connected
        } else {
            GpsMsg::Disconnected
        };
        cb(&msg);

        self.subscribers.push((id, cb));
        id
    }

    pub fn unsubscribe(&mut self, id: SubId) {
        self.subscribers.retain(|(sid, _)| *sid != id);
    }

    fn broadcast(&mut self, msg: &GpsMsg) {
        for (_, cb) in &mut self.subscribers {
            cb(msg);
        }
    }

    fn schedule_reconnect(&self) {
        if self.reconnect_delay_ms == 0 {
            return;
        }
        self.shell
            .insert_timer(TimerId::GpsReconnect, self.reconnect_delay_ms);
    }

    fn try_connect(&mut self) -> bool {
        if self.connected {
            return true;
        }
        if !self.transport.connect() {
            return false;
        }

        self.connected = true;
        info!("gps connected");
        self.broadcast(&GpsMsg::Connected);
        self.shell
            .insert_timer(TimerId::GpsReadTimeout, GPS_READ_TIMEOUT_MS);
        true
    }

    /// Connect to the GPS source; on failure a reconnect timer keeps
    /// retrying.
    pub fn connect(&mut self) -> bool {
        if self.try_connect() {
            return true;
        }
        self.schedule_reconnect();
        false
    }

    /// Disconnect and stop reconnecting.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.connected = false;
        self.shell.cancel_timer(TimerId::GpsReadTimeout);
        self.shell.cancel_timer(TimerId::GpsReconnect);
        info!("gps disconnected");
        self.broadcast(&GpsMsg::Disconnected);
    }

    /// A position packet arrived; broadcast it and re-arm the read
    /// timeout.
    pub fn on_fix(&mut self, fix: GpsFix) {
        self.shell.cancel_timer(TimerId::GpsReadTimeout);
        self.broadcast(&GpsMsg::Fix(fix));
        self.shell
            .insert_timer(TimerId::GpsReadTimeout, GPS_READ_TIMEOUT_MS);
    }

    /// The read side failed; drop the connection and start reconnecting.
    pub fn on_read_error(&mut self) {
        self.shell.cancel_timer(TimerId::GpsReadTimeout);
        self.transport.disconnect();
        self.connected = false;
        info!("gps read failed, reconnecting");
        self.broadcast(&GpsMsg::Disconnected);
        self.schedule_reconnect();
    }

    /// Timer dispatch; the host calls this when a GPS timer expires.
    pub fn on_timer(&mut self, id: TimerId) -> TimerOutcome {
        match id {
            TimerId::GpsReadTimeout => {
                self.broadcast(&GpsMsg::NoData);
                TimerOutcome::Stop
            }
            TimerId::GpsReconnect => {
                if self.try_connect() {
                    TimerOutcome::Stop
                } else {
                    TimerOutcome::RescheduleMs(self.reconnect_delay_ms)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use crate::test_utils::RecordingShell;

    struct ScriptedTransport {
        results: Rc<RefCell<VecDeque<bool>>>,
    }

    impl GpsTransport for ScriptedTransport {
        fn connect(&mut self) -> bool {
            self.results.borrow_mut().pop_front().unwrap_or(false)
        }

        fn disconnect(&mut self) {}
    }

    fn link_with(
        script: &[bool],
        shell: Rc<RecordingShell>,
    ) -> (GpsLink, Rc<RefCell<Vec<String>>>) {
        let results: Rc<RefCell<VecDeque<bool>>> =
            Rc::new(RefCell::new(script.iter().copied().collect()));
        let mut link = GpsLink::new(Box::new(ScriptedTransport { results }), shell);

        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        link.subscribe(Box::new(move |msg| {
            let tag = match msg {
                GpsMsg::Connected => "connected",
                GpsMsg::Disconnected => "disconnected",
                GpsMsg::NoData => "no-data",
                GpsMsg::Fix(_) => "fix",
            };
            sink.borrow_mut().push(tag.to_string());
        }));
        (link, log)
    }

    fn test_fix() -> GpsFix {
        GpsFix {
            lat: 50.0,
            lon: 14.0,
            alt: 200.0,
            mode: GpsMode::Fix3d,
            epx: 3.0,
            epy: 4.0,
        }
    }

    #[test]
    fn new_subscriber_learns_the_current_state() {
        let shell = Rc::new(RecordingShell::new());
        let (_, log) = link_with(&[], shell);
        assert_eq!(*log.borrow(), vec!["disconnected"]);
    }

    #[test]
    fn successful_connect_broadcasts_and_arms_the_timeout() {
        let shell = Rc::new(RecordingShell::new());
        let (mut link, log) = link_with(&[true], shell.clone());

        assert!(link.connect());
        assert!(link.is_connected());
        assert_eq!(*log.borrow(), vec!["disconnected", "connected"]);
        assert_eq!(
            shell.timers().last(),
            Some(&(TimerId::GpsReadTimeout, GPS_READ_TIMEOUT_MS))
        );
    }

    #[test]
    fn failed_connect_schedules_a_reconnect() {
        let shell = Rc::new(RecordingShell::new());
        let (mut link, _) = link_with(&[false, true], shell.clone());

        assert!(!link.connect());
        assert_eq!(
            shell.timers().last(),
            Some(&(TimerId::GpsReconnect, GPS_RECONNECT_DELAY_MS))
        );

        // first retry succeeds
        assert_eq!(link.on_timer(TimerId::GpsReconnect), TimerOutcome::Stop);
        assert!(link.is_connected());
    }

    #[test]
    fn reconnect_timer_keeps_rescheduling_until_up() {
        let shell = Rc::new(RecordingShell::new());
        let (mut link, _) = link_with(&[false, false, true], shell);

        assert!(!link.connect());
        assert_eq!(
            link.on_timer(TimerId::GpsReconnect),
            TimerOutcome::RescheduleMs(GPS_RECONNECT_DELAY_MS)
        );
        assert_eq!(link.on_timer(TimerId::GpsReconnect), TimerOutcome::Stop);
    }

    #[test]
    fn fix_broadcasts_and_rearms_the_timeout() {
        let shell = Rc::new(RecordingShell::new());
        let (mut link, log) = link_with(&[true], shell.clone());
        link.connect();

        link.on_fix(test_fix());

        assert_eq!(log.borrow().last().map(String::as_str), Some("fix"));
        assert!(shell.cancelled().contains(&TimerId::GpsReadTimeout));
        assert_eq!(
            shell.timers().last(),
            Some(&(TimerId::GpsReadTimeout, GPS_READ_TIMEOUT_MS))
        );
    }

    #[test]
    fn read_timeout_reports_no_data() {
        let shell = Rc::new(RecordingShell::new());
        let (mut link, log) = link_with(&[true], shell);
        link.connect();

        assert_eq!(link.on_timer(TimerId::GpsReadTimeout), TimerOutcome::Stop);
        assert_eq!(log.borrow().last().map(String::as_str), Some("no-data"));
    }

    #[test]
    fn read_error_disconnects_and_reconnects() {
        let shell = Rc::new(RecordingShell::new());
        let (mut link, log) = link_with(&[true], shell.clone());
        link.connect();

        link.on_read_error();

        assert!(!link.is_connected());
        assert_eq!(
            log.borrow().last().map(String::as_str),
            Some("disconnected")
        );
        assert_eq!(
            shell.timers().last(),
            Some(&(TimerId::GpsReconnect, GPS_RECONNECT_DELAY_MS))
        );
    }

    #[test]
    fn zero_delay_disables_reconnection() {
        let shell = Rc::new(RecordingShell::new());
        let (mut link, _) = link_with(&[false], shell.clone());
        link.set_reconnect_delay_ms(0);

        assert!(!link.connect());
        assert!(shell.timers().is_empty());
    }

    #[test]
    fn unsubscribed_listeners_stop_receiving() {
        let shell = Rc::new(RecordingShell::new());
        let results = Rc::new(RefCell::new(VecDeque::from([true])));
        let mut link = GpsLink::new(Box::new(ScriptedTransport { results }), shell);

        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let id = link.subscribe(Box::new(move |_| sink.borrow_mut().push(())));
        assert_eq!(log.borrow().len(), 1);

        link.unsubscribe(id);
        link.connect();
        assert_eq!(log.borrow().len(), 1);
    }
}
