// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod connection;
pub mod connection_ssh;
pub mod connection_tcp;
pub mod error;
pub mod messages;
pub mod server;
pub mod session;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
mod test;

/// The port RTR caches conventionally listen on.
pub const RTR_PORT: u16 = 8282;
