// Copyright (c) 2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end reconciliation scenarios, driven against a recording bus
//! and real child processes.

extern crate libc;
extern crate procman_deputy;
extern crate procman_protocol as protocol;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use procman_deputy::bus::Bus;
use procman_deputy::deputy::{timestamp_now, Deputy};
use procman_deputy::error::Result;
use protocol::{CmdOrder, InfoMessage, OrdersMessage, PrintfMessage};

#[derive(Default)]
struct Record {
    infos: Vec<InfoMessage>,
    printfs: Vec<PrintfMessage>,
}

/// A bus that records everything published and never delivers anything;
/// tests hand orders straight to the reconciler.
struct TestBus {
    record: Rc<RefCell<Record>>,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl TestBus {
    fn new() -> (TestBus, Rc<RefCell<Record>>) {
        let record = Rc::new(RefCell::new(Record::default()));
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let bus = TestBus {
            record: record.clone(),
            read_fd: fds[0],
            write_fd: fds[1],
        };
        (bus, record)
    }
}

impl Drop for TestBus {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

impl Bus for TestBus {
    fn fd(&self) -> RawFd {
        self.read_fd
    }

    fn try_recv_orders(&mut self) -> Result<Option<OrdersMessage>> {
        Ok(None)
    }

    fn publish_info(&mut self, msg: &InfoMessage) -> Result<()> {
        self.record.borrow_mut().infos.push(msg.clone());
        Ok(())
    }

    fn publish_printf(&mut self, msg: &PrintfMessage) -> Result<()> {
        self.record.borrow_mut().printfs.push(msg.clone());
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<()> {
        Ok(())
    }
}

fn orders_for(host: &str, cmds: Vec<CmdOrder>) -> OrdersMessage {
    OrdersMessage {
        utime: timestamp_now(),
        host: host.to_string(),
        sheriff_name: "test-sheriff".to_string(),
        cmds: cmds,
    }
}

fn order(sheriff_id: i32, exec_str: &str, nickname: &str, runid: i64, force_quit: bool) -> CmdOrder {
    CmdOrder {
        exec_str: exec_str.to_string(),
        nickname: nickname.to_string(),
        group: "test/group".to_string(),
        desired_runid: runid,
        force_quit: force_quit,
        sheriff_id: sheriff_id,
    }
}

fn wait_for_reap(deputy: &mut Deputy<TestBus>) -> bool {
    for _ in 0..500 {
        if deputy.reap_dead() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn orders_start_a_command_and_reap_records_its_exit() {
    let (bus, record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/true", "t", 1, false)]));

    let pid = deputy.cmds().get(7).expect("command created").pid();
    assert!(pid > 0);
    {
        let rec = record.borrow();
        let info = rec.infos.last().expect("info after action");
        let status = info.cmds.iter().find(|c| c.sheriff_id == 7).unwrap();
        assert_eq!(status.pid, pid as i32);
        assert_eq!(status.actual_runid, 1);
        assert_eq!(status.group, "test/group");
        assert_eq!(status.nickname, "t");
    }

    assert!(wait_for_reap(&mut deputy));
    assert_eq!(deputy.cmds().get(7).unwrap().pid(), 0);

    let rec = record.borrow();
    let stopped: Vec<&InfoMessage> = rec
        .infos
        .iter()
        .filter(|info| info.cmds.iter().any(|c| c.sheriff_id == 7 && c.pid == 0))
        .collect();
    assert_eq!(stopped.len(), 1);
    let status = stopped[0].cmds.iter().find(|c| c.sheriff_id == 7).unwrap();
    assert!(libc::WIFEXITED(status.exit_code));
    assert_eq!(libc::WEXITSTATUS(status.exit_code), 0);
}

#[test]
fn bumping_the_runid_stops_then_respawns() {
    let (bus, _record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 30", "s", 1, false)]));
    let first_pid = deputy.cmds().get(7).unwrap().pid();
    assert!(first_pid > 0);

    // Bumped runid: the running instance is stopped first.
    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 30", "s", 2, false)]));
    assert!(wait_for_reap(&mut deputy));
    {
        let cmd = deputy.cmds().get(7).unwrap();
        assert_eq!(cmd.pid(), 0);
        assert_eq!(cmd.actual_runid(), 1);
    }

    // The next reconciliation spawns the new instance.
    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 30", "s", 2, false)]));
    {
        let cmd = deputy.cmds().get(7).unwrap();
        assert!(cmd.pid() > 0);
        assert!(cmd.pid() != first_pid);
        assert_eq!(cmd.actual_runid(), 2);
    }

    deputy.handle_orders(orders_for("h", vec![]));
    assert!(wait_for_reap(&mut deputy));
    assert_eq!(deputy.cmds().len(), 0);
}

#[test]
fn force_quit_stops_and_nothing_respawns() {
    let (bus, _record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 30", "s", 2, false)]));
    assert!(deputy.cmds().get(7).unwrap().is_running());

    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 30", "s", 2, true)]));
    assert!(wait_for_reap(&mut deputy));
    assert_eq!(deputy.cmds().get(7).unwrap().pid(), 0);

    // While force_quit holds, reconciliation leaves it down.
    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 30", "s", 2, true)]));
    let cmd = deputy.cmds().get(7).unwrap();
    assert_eq!(cmd.pid(), 0);
    assert_eq!(cmd.actual_runid(), 2);
}

#[test]
fn culled_commands_are_stopped_and_removed() {
    let (bus, _record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    deputy.handle_orders(orders_for(
        "h",
        vec![
            order(7, "/bin/sleep 30", "runner", 1, false),
            // force_quit keeps this one from ever starting.
            order(8, "/bin/sleep 30", "unborn", 1, true),
        ],
    ));
    assert!(deputy.cmds().get(7).unwrap().is_running());
    assert!(!deputy.cmds().get(8).unwrap().is_running());

    deputy.handle_orders(orders_for("h", vec![]));
    // The unborn command is gone synchronously, no signals involved.
    assert!(deputy.cmds().get(8).is_none());
    // The running one is condemned and stopped, deleted after its reap.
    assert!(deputy.cmds().get(7).unwrap().remove_requested());
    assert!(wait_for_reap(&mut deputy));
    assert!(deputy.cmds().get(7).is_none());
    assert_eq!(deputy.cmds().len(), 0);
}

#[test]
fn stale_orders_are_counted_and_reported_but_not_acted_on() {
    let (bus, record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    let mut orders = orders_for("h", vec![order(9, "/bin/true", "t", 1, false)]);
    orders.utime = timestamp_now() - 60_000_000;
    deputy.handle_orders(orders);

    assert!(deputy.cmds().get(9).is_none());
    assert_eq!(deputy.orders_seen(), 1);
    assert_eq!(deputy.orders_for_me(), 1);
    assert_eq!(deputy.stale_orders(), 1);

    let rec = record.borrow();
    assert!(rec.infos.is_empty());
    assert_eq!(rec.printfs.len(), 1);
    assert_eq!(rec.printfs[0].sheriff_id, 9);
    assert!(rec.printfs[0].text.contains("stale"));
}

#[test]
fn orders_for_another_host_change_nothing() {
    let (bus, record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    deputy.handle_orders(orders_for("other", vec![order(1, "/bin/true", "t", 1, false)]));

    assert_eq!(deputy.cmds().len(), 0);
    assert_eq!(deputy.orders_seen(), 1);
    assert_eq!(deputy.orders_for_me(), 0);
    assert_eq!(deputy.stale_orders(), 0);
    let rec = record.borrow();
    assert!(rec.infos.is_empty());
    assert!(rec.printfs.is_empty());
}

#[test]
fn renaming_a_running_command_changes_metadata_only() {
    let (bus, _record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 30", "old", 1, false)]));
    let pid = deputy.cmds().get(7).unwrap().pid();
    assert!(pid > 0);

    deputy.handle_orders(orders_for("h", vec![order(7, "/bin/sleep 60", "new", 1, false)]));
    {
        let cmd = deputy.cmds().get(7).unwrap();
        assert_eq!(cmd.pid(), pid);
        assert_eq!(cmd.nickname(), "new");
        assert_eq!(cmd.exec_str(), "/bin/sleep 60");
        // No signal was ever sent at it.
        assert_eq!(cmd.num_kills_sent(), 0);
    }

    deputy.handle_orders(orders_for("h", vec![]));
    assert!(wait_for_reap(&mut deputy));
}

#[test]
fn child_output_is_forwarded_verbatim_with_its_sheriff_id() {
    let (bus, record) = TestBus::new();
    let mut deputy = Deputy::new("h".to_string(), false, bus);
    deputy.handle_orders(orders_for(
        "h",
        vec![order(
            5,
            "/bin/sh -c \"printf 'hello from child'\"",
            "echoer",
            1,
            false,
        )],
    ));

    let mut collected = String::new();
    for _ in 0..500 {
        deputy.read_cmd_output(5);
        deputy.reap_dead();
        collected = record
            .borrow()
            .printfs
            .iter()
            .filter(|p| p.sheriff_id == 5)
            .map(|p| p.text.as_str())
            .collect();
        if collected.contains("hello from child") {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        collected.contains("hello from child"),
        "forwarded output was: {:?}",
        collected
    );
}
