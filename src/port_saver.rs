use rocket::fairing::Info;
use rocket::{Orbit, Rocket};
use tokio::sync::{mpsc, Mutex};

/// Reports the port Rocket actually bound to, which matters when the
/// configuration asks for port 0.
pub fn create_pair() -> (PortSaver, Port) {
    let (tx, rx) = mpsc::channel(1);
    let port_saver = PortSaver::new(tx);
    let port = Port::new(rx);
    (port_saver, port)
}

pub struct Port {
    port: Mutex<Option<u16>>,
    rx: Mutex<mpsc::Receiver<u16>>,
}

impl Port {
    fn new(rx: mpsc::Receiver<u16>) -> Port {
        Port {
            port: Mutex::new(None),
            rx: Mutex::new(rx),
        }
    }

    /// Waits for liftoff. `None` if the server was dropped before it bound.
    pub async fn get(&self) -> Option<u16> {
        let mut port_guard = self.port.lock().await;
        if port_guard.is_none() {
            *port_guard = self.rx.lock().await.recv().await;
        }
        *port_guard
    }
}

pub struct PortSaver {
    sender: mpsc::Sender<u16>,
}

impl PortSaver {
    fn new(sender: mpsc::Sender<u16>) -> PortSaver {
        PortSaver { sender }
    }
}

#[rocket::async_trait]
impl rocket::fairing::Fairing for PortSaver {
    fn info(&self) -> Info {
        Info {
            name: "Port Saver",
            kind: rocket::fairing::Kind::Liftoff,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let port = rocket.config().port;
        tracing::info!(port, "Server listening");
        if self.sender.send(port).await.is_err() {
            tracing::warn!("Nobody is waiting for the bound port");
        }
    }
}
