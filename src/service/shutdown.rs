// Copyright 2025 jonefeewang@gmail.com
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

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Closer;

/// Listens for the process-wide shutdown notification.
///
/// The signal fires once, either on an explicit send or when every sender is
/// dropped.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn subscribe(notify: &broadcast::Sender<()>) -> Shutdown {
        Shutdown::new(notify.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }

    /// Closes the connection behind `closer` once shutdown fires.
    ///
    /// Any receive or send blocked on that connection then fails with
    /// `ConnectionClosed`. Abort the returned task when the connection ends
    /// first.
    pub fn close_on_shutdown(mut self, closer: Closer) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.recv().await;
            if closer.close().is_ok() {
                debug!("connection closed by shutdown");
            }
        })
    }
}
