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

//! The reconciler: maps one authoritative orders snapshot onto the
//! local command set.

use time::SteadyTime;

use bus::Bus;
use cmd::Cmd;
use protocol::{OrdersMessage, MAX_MESSAGE_AGE_USEC};

use super::{timestamp_now, Deputy};

static LOGKEY: &'static str = "OR";

impl<B: Bus> Deputy<B> {
    /// Reconcile one orders snapshot against the local command set.
    /// Orders for other hosts are dropped whole; stale orders are
    /// rejected with a notice per batched command. Any action taken
    /// triggers an immediate info broadcast on top of the periodic one.
    pub fn handle_orders(&mut self, orders: OrdersMessage) {
        self.orders_seen += 1;
        if orders.host != self.hostname {
            debug!("ignoring orders for host \"{}\"", orders.host);
            return;
        }
        self.orders_for_me += 1;

        let age_usec = timestamp_now() - orders.utime;
        if age_usec > MAX_MESSAGE_AGE_USEC {
            self.stale_orders += 1;
            for order in &orders.cmds {
                self.send_printf(
                    order.sheriff_id,
                    &format!(
                        "Ignoring stale orders from {} (age {} ms)\n",
                        orders.sheriff_name,
                        age_usec / 1_000
                    ),
                );
            }
            return;
        }

        self.observed_sheriffs.insert(orders.sheriff_name.clone());
        self.last_sheriff_name = Some(orders.sheriff_name.clone());

        let mut dirty = false;
        for order in &orders.cmds {
            if !self.cmds.contains(order.sheriff_id) {
                outputln!("[{}] new command \"{}\"", order.nickname, order.exec_str);
                self.cmds.insert(Cmd::new(
                    order.sheriff_id,
                    order.exec_str.clone(),
                    order.nickname.clone(),
                    order.group.clone(),
                ));
                dirty = true;
            }

            // Metadata sync. None of these touch a running child; a new
            // exec string takes effect on the next start.
            let (running, actual_runid) = {
                let cmd = match self.cmds.get_mut(order.sheriff_id) {
                    Some(cmd) => cmd,
                    None => continue,
                };
                if cmd.exec_str() != order.exec_str {
                    cmd.set_exec_str(order.exec_str.clone());
                }
                if cmd.nickname() != order.nickname {
                    cmd.set_nickname(order.nickname.clone());
                }
                if cmd.group() != order.group {
                    cmd.set_group(order.group.clone());
                }
                (cmd.is_running(), cmd.actual_runid())
            };

            if !running && actual_runid != order.desired_runid && !order.force_quit {
                dirty = true;
                let result = match self.cmds.get_mut(order.sheriff_id) {
                    Some(cmd) => cmd.start(order.desired_runid),
                    None => continue,
                };
                match result {
                    Ok(()) => {
                        let pid = self
                            .cmds
                            .get(order.sheriff_id)
                            .map(|cmd| cmd.pid())
                            .unwrap_or(0);
                        outputln!("[{}] started (pid {})", order.nickname, pid);
                        self.send_printf(
                            order.sheriff_id,
                            &format!("Started \"{}\" (pid {})\n", order.exec_str, pid),
                        );
                    }
                    Err(e) => {
                        error!("[{}] unable to start: {}", order.nickname, e);
                        self.send_printf(
                            order.sheriff_id,
                            &format!("Couldn't start command: {}\n", e),
                        );
                    }
                }
            } else if running && (order.force_quit || actual_runid != order.desired_runid) {
                let result = match self.cmds.get_mut(order.sheriff_id) {
                    Some(cmd) => cmd.stop(SteadyTime::now()),
                    None => continue,
                };
                match result {
                    Ok(sent) => {
                        if sent {
                            dirty = true;
                        }
                    }
                    Err(e) => {
                        warn!("[{}] unable to stop: {}", order.nickname, e);
                        self.send_printf(
                            order.sheriff_id,
                            &format!("Couldn't stop command: {}\n", e),
                        );
                    }
                }
            } else {
                // Already converged; keep the bookkeeping in sync.
                if let Some(cmd) = self.cmds.get_mut(order.sheriff_id) {
                    cmd.set_actual_runid(order.desired_runid);
                }
            }
        }

        // Cull commands the sheriff no longer mentions. Targets are
        // collected first; the table is never mutated mid-iteration.
        let culled: Vec<i32> = self
            .cmds
            .ids()
            .into_iter()
            .filter(|id| !orders.cmds.iter().any(|order| order.sheriff_id == *id))
            .collect();
        for id in culled {
            dirty = true;
            let running = self.cmds.get(id).map(|cmd| cmd.is_running()).unwrap_or(false);
            if running {
                // Deletion happens after the reap.
                let result = {
                    let cmd = match self.cmds.get_mut(id) {
                        Some(cmd) => cmd,
                        None => continue,
                    };
                    cmd.request_remove();
                    cmd.stop(SteadyTime::now())
                };
                if let Err(e) = result {
                    warn!("unable to stop culled command {}: {}", id, e);
                    self.send_printf(id, &format!("Couldn't stop command: {}\n", e));
                }
            } else if let Some(cmd) = self.cmds.remove(id) {
                // Never ran (or already reaped): a direct delete, no
                // signals involved.
                outputln!("[{}] removed", cmd.nickname());
            }
        }

        if dirty {
            self.send_info();
        }
    }
}
