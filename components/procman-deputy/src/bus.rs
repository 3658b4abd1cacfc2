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

//! Pub/sub bus access. The deputy core only sees the `Bus` trait; the
//! ZeroMQ implementation below is the production transport, and tests
//! substitute their own recording bus.

use std::os::unix::io::RawFd;

use protocol::{self, InfoMessage, OrdersMessage, PrintfMessage};
use zmq;

use error::Result;

/// Default transport URL: the same multicast group any sheriff or deputy
/// on the segment joins, so the bus needs no broker.
pub const DEFAULT_BUS_URL: &'static str = "epgm://239.255.76.67:7667";

pub trait Bus {
    /// Readability fd for the main loop's poll set. The fd may be
    /// edge-triggered; callers must drain `try_recv_orders` to empty on
    /// every wakeup.
    fn fd(&self) -> RawFd;

    /// Non-blocking receive of the next pending orders message, if any.
    fn try_recv_orders(&mut self) -> Result<Option<OrdersMessage>>;

    fn publish_info(&mut self, msg: &InfoMessage) -> Result<()>;

    fn publish_printf(&mut self, msg: &PrintfMessage) -> Result<()>;

    /// Drop the orders subscription; called once, on shutdown.
    fn unsubscribe(&mut self) -> Result<()>;
}

/// ZeroMQ PUB/SUB transport. Both sockets connect to the same endpoint;
/// with the default multicast URL every participant sees every frame and
/// subscription prefixes do the channel filtering.
pub struct ZmqBus {
    /// Sockets must not outlive their context.
    _context: zmq::Context,
    sub: zmq::Socket,
    publisher: zmq::Socket,
    fd: RawFd,
}

impl ZmqBus {
    pub fn new(url: &str) -> Result<ZmqBus> {
        let context = zmq::Context::new();
        let sub = context.socket(zmq::SUB)?;
        sub.connect(url)?;
        sub.set_subscribe(protocol::ORDERS_CHANNEL.as_bytes())?;
        let publisher = context.socket(zmq::PUB)?;
        publisher.set_linger(0)?;
        publisher.connect(url)?;
        let fd = sub.get_fd()? as RawFd;
        Ok(ZmqBus {
            _context: context,
            sub: sub,
            publisher: publisher,
            fd: fd,
        })
    }
}

impl Bus for ZmqBus {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn try_recv_orders(&mut self) -> Result<Option<OrdersMessage>> {
        let frame = match self.sub.recv_bytes(zmq::DONTWAIT) {
            Ok(frame) => frame,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (channel, body) = protocol::split_frame(&frame)?;
        if channel != protocol::ORDERS_CHANNEL {
            debug!("ignoring frame on unexpected channel {}", channel);
            return Ok(None);
        }
        let orders = protocol::decode::<OrdersMessage>(body)?;
        Ok(Some(orders))
    }

    fn publish_info(&mut self, msg: &InfoMessage) -> Result<()> {
        let frame = protocol::encode(protocol::INFO_CHANNEL, msg)?;
        self.publisher.send(frame, 0)?;
        Ok(())
    }

    fn publish_printf(&mut self, msg: &PrintfMessage) -> Result<()> {
        let frame = protocol::encode(protocol::PRINTF_CHANNEL, msg)?;
        self.publisher.send(frame, 0)?;
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<()> {
        self.sub
            .set_unsubscribe(protocol::ORDERS_CHANNEL.as_bytes())?;
        Ok(())
    }
}
