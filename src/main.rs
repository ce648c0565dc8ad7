//! `gattlinkd`: runs one BLE role over BlueZ and logs its events as JSON.
//!
//! `gattlinkd central` connects to the configured service and logs value
//! updates. `gattlinkd peripheral` advertises it and notifies subscribers
//! with each line read from stdin.

use std::{env, str::FromStr, sync::Arc};

use log::{error, info, warn};
use tokio::{
   io::{self, AsyncBufReadExt, BufReader},
   select, signal,
};

use gattlink::{
   CentralEvent, CentralSession, Config, EventQueue, LinkError, PeripheralSession, Result,
   SessionEvent,
   transport::bluez::{self, BluezTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Role {
   Central,
   Peripheral,
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let Some(role) = env::args().nth(1).and_then(|arg| Role::from_str(&arg).ok()) else {
      eprintln!("usage: gattlinkd <central|peripheral>");
      std::process::exit(2);
   };

   info!("Starting gattlinkd as {role}...");

   let config = Config::load()?;
   let identity = config.identity()?;
   info!(
      "Loaded configuration for {identity} with {} characteristic(s)",
      identity.characteristic_uuids().len()
   );

   if !bluez::is_bluetooth_supported().await {
      error!("No usable Bluetooth adapter found");
      return Err(LinkError::BluetoothNotSupported);
   }

   let transport =
      Arc::new(BluezTransport::new(config.adapter.as_deref(), config.advertising).await?);
   let events = EventQueue::new();

   match role {
      Role::Central => {
         let session = CentralSession::new(identity, transport, events.clone(), config.timeouts());
         session.connect().await?;
         run_central(&session, &events).await;
         session.disconnect().await?;
      },
      Role::Peripheral => {
         let session = PeripheralSession::new(identity, transport, events.clone())?;
         session.start_advertising().await?;
         run_peripheral(&session, &events).await?;
         session.stop_advertising().await?;
      },
   }

   info!("Shutting down gattlinkd...");
   Ok(())
}

fn log_event(event: &SessionEvent) {
   info!("{}", event.to_json());
}

async fn run_central(session: &CentralSession, events: &Arc<EventQueue>) {
   loop {
      select! {
          event = events.recv() => {
              let Some(event) = event else { break };
              log_event(&event);
              match event {
                  SessionEvent::Central(CentralEvent::Connected(_)) => {
                      if let Err(e) = session.subscribe().await {
                          warn!("Subscribe failed: {e}");
                      }
                  },
                  // Sessions never reconnect on their own; the retry policy lives here.
                  SessionEvent::Central(CentralEvent::Disconnected) => {
                      info!("Link down, scanning again");
                      if let Err(e) = session.connect().await {
                          warn!("Reconnect failed: {e}");
                      }
                  },
                  SessionEvent::Central(CentralEvent::ConnectFailed(_)) => break,
                  _ => {},
              }
          }
          _ = signal::ctrl_c() => break,
      }
   }
}

async fn run_peripheral(session: &PeripheralSession, events: &Arc<EventQueue>) -> Result<()> {
   let mut lines = BufReader::new(io::stdin()).lines();
   let mut stdin_open = true;
   loop {
      select! {
          event = events.recv() => {
              let Some(event) = event else { break };
              log_event(&event);
          }
          line = lines.next_line(), if stdin_open => {
              match line? {
                  Some(line) => {
                      let sent = session.send_to_subscribers(line.as_bytes()).await?;
                      info!("Sent {} byte(s) to {sent} subscriber(s)", line.len());
                  },
                  None => {
                      info!("stdin closed, still advertising");
                      stdin_open = false;
                  },
              }
          }
          _ = signal::ctrl_c() => break,
      }
   }
   Ok(())
}
