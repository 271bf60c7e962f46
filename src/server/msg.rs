//! Per-name message listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::common::Counter;
use crate::server::conn::Conn;

/// An inbound one-way message, as handed to listeners.
#[derive(Debug, Clone)]
pub struct MsgCall {
    /// The message service.
    pub msg_name: String,
    /// Message body.
    pub msg: Value,
    /// The connection it arrived on.
    pub conn: Arc<Conn>,
}

type Listener = Arc<dyn Fn(MsgCall) + Send + Sync>;

struct Entry {
    id: u32,
    once: bool,
    listener: Listener,
}

/// Listener registry: multiple listeners per message name, invoked in
/// registration order. Shared by every connection of a server.
pub(crate) struct MsgListeners {
    ids: Counter,
    table: Mutex<HashMap<String, Vec<Entry>>>,
}

impl MsgListeners {
    pub(crate) fn new() -> MsgListeners {
        MsgListeners {
            ids: Counter::new(),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a listener; the returned id identifies it to
    /// [`off`](MsgListeners::off).
    pub(crate) fn on(&self, msg_name: &str, once: bool, listener: Listener) -> u32 {
        let id = self.ids.next();
        self.table
            .lock()
            .unwrap()
            .entry(msg_name.to_owned())
            .or_insert_with(Vec::new)
            .push(Entry { id, once, listener });
        id
    }

    /// Removes one listener by id.
    pub(crate) fn off(&self, msg_name: &str, id: u32) {
        if let Some(entries) = self.table.lock().unwrap().get_mut(msg_name) {
            entries.retain(|e| e.id != id);
        }
    }

    /// Removes every listener for a name.
    pub(crate) fn off_all(&self, msg_name: &str) {
        self.table.lock().unwrap().remove(msg_name);
    }

    /// Invokes the listeners registered for the call's name, in registration
    /// order, dropping `once` listeners afterwards. Returns how many fired.
    pub(crate) fn emit(&self, call: MsgCall) -> usize {
        let snapshot: Vec<Listener> = {
            let mut table = self.table.lock().unwrap();
            match table.get_mut(&call.msg_name) {
                Some(entries) => {
                    let fired: Vec<Listener> =
                        entries.iter().map(|e| e.listener.clone()).collect();
                    entries.retain(|e| !e.once);
                    fired
                }
                None => return 0,
            }
        };
        let n = snapshot.len();
        for listener in snapshot {
            listener(call.clone());
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::log::{LogLevel, Logger};
    use crate::proto::DataType;
    use crate::server::conn::{ConnSink, HttpSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call(name: &str) -> MsgCall {
        let (sink, _rx) = HttpSink::new();
        let sink: Box<dyn ConnSink> = Box::new(sink);
        MsgCall {
            msg_name: name.to_owned(),
            msg: json!({"content": "hi"}),
            conn: Arc::new(Conn::new(
                1,
                None,
                DataType::Text,
                sink,
                Logger::new("[test] ", LogLevel::None),
            )),
        }
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let listeners = MsgListeners::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            listeners.on("Chat", false, Arc::new(move |_| order.lock().unwrap().push(i)));
        }
        assert_eq!(listeners.emit(call("Chat")), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn once_listener_fires_once() {
        let listeners = MsgListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        listeners.on("Chat", true, Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        listeners.emit(call("Chat"));
        listeners.emit(call("Chat"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_only_the_named_listener() {
        let listeners = MsgListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let id = listeners.on("Chat", false, Arc::new(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = count.clone();
        listeners.on("Chat", false, Arc::new(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        }));
        listeners.off("Chat", id);
        listeners.emit(call("Chat"));
        assert_eq!(count.load(Ordering::SeqCst), 10);

        listeners.off_all("Chat");
        assert_eq!(listeners.emit(call("Chat")), 0);
    }
}
