use std::fmt::Display;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use vmci_core::config::VmciConfig;
use vmci_core::context::CheckpointKind;
use vmci_core::discovery::{DiscoveryAction, DiscoveryRequest, DiscoveryResponse};
use vmci_core::fabric::VmciFabric;
use vmci_core::handle::{Handle, HOST_CONTEXT, WELL_KNOWN_CONTEXT};
use vmci_core::resource::{Privilege, PrivilegeCheck};
use vmci_core::wire::{Datagram, PrivilegeFlags};

pub const EX_SOFTWARE: u8 = 70;

pub struct CommandError {
    message: String,
    exit_code: u8,
}

trait ToCommandError<T, E> {
    fn to_command_error<C: Display>(self, context: C, exit_code: u8) -> Result<T, CommandError>;
}

impl<T, E> ToCommandError<T, E> for Result<T, E>
where
    E: Display,
{
    fn to_command_error<C: Display>(self, context: C, exit_code: u8) -> Result<T, CommandError> {
        match self {
            Ok(ok) => Ok(ok),
            Err(e) => Err(CommandError {
                message: format!("{}: {}", context, e),
                exit_code,
            }),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Smoke-test CLI driving an in-process `vmci-core` fabric. Each subcommand
/// builds its own fabric and runs a short scripted exercise of one
/// component, printing what happened along the way.
#[derive(Debug, Parser)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Exercises context lifecycle: init, a notifier subscription, and the
    /// `CTX_REMOVED` fan-out a release produces.
    Contexts,
    /// Exercises the resource table: a group resource, client ACL grants and
    /// denials, and a privilege check against both.
    Resources,
    /// Exercises datagram dispatch: a host endpoint, a guest sender, and a
    /// round trip through the discovery well-known endpoint.
    Send,
}

impl Commands {
    pub async fn run(self) -> CommandResult<()> {
        match self {
            Commands::Contexts => run_contexts().await,
            Commands::Resources => run_resources().await,
            Commands::Send => run_send().await,
        }
    }
}

async fn run_contexts() -> CommandResult<()> {
    let fabric = VmciFabric::new(VmciConfig::default());

    let watcher = fabric
        .init_context(100, PrivilegeFlags::empty(), 1)
        .to_command_error("initializing watcher context", EX_SOFTWARE)?;
    let watched = fabric
        .init_context(101, PrivilegeFlags::empty(), 1)
        .to_command_error("initializing watched context", EX_SOFTWARE)?;
    println!("initialized contexts {watcher} and {watched}");

    fabric
        .add_notification(watcher, watched)
        .to_command_error("subscribing to removal notifications", EX_SOFTWARE)?;
    println!("{watcher} now watches {watched} for removal");

    fabric
        .release_context(watched)
        .to_command_error("releasing watched context", EX_SOFTWARE)?;
    println!("released context {watched}");

    match fabric
        .dequeue_datagram(watcher, 4096)
        .to_command_error("dequeuing CTX_REMOVED notification", EX_SOFTWARE)?
    {
        vmci_core::context::DequeueOutcome::Ready(d) => {
            println!("{watcher} received a {} byte CTX_REMOVED datagram", d.datagram.payload.len());
        }
        _ => println!("{watcher} saw no notification (unexpected)"),
    }

    let saved = fabric
        .get_checkpoint_state(watcher, CheckpointKind::Notifier)
        .to_command_error("reading checkpoint state", EX_SOFTWARE)?;
    println!("{watcher}'s notifier checkpoint set: {saved:?}");

    Ok(())
}

async fn run_resources() -> CommandResult<()> {
    let fabric = VmciFabric::new(VmciConfig::default());
    let owner = fabric
        .init_context(50, PrivilegeFlags::TRUSTED, 1)
        .to_command_error("initializing owner context", EX_SOFTWARE)?;

    let group = Handle::new(WELL_KNOWN_CONTEXT, 500);
    fabric
        .group_create(group, Handle::new(owner, 0))
        .to_command_error("creating group", EX_SOFTWARE)?;
    fabric
        .group_add_member(group, 60, true)
        .to_command_error("adding allowed member", EX_SOFTWARE)?;
    fabric
        .group_add_member(group, 61, false)
        .to_command_error("adding denied member", EX_SOFTWARE)?;

    for (label, cid) in [("allowed", 60u32), ("denied", 61u32)] {
        let check = fabric
            .check_client_privilege(group, cid, Privilege::AssignClient)
            .to_command_error("checking privilege", EX_SOFTWARE)?;
        let verdict = match check {
            PrivilegeCheck::AccessGranted => "granted",
            PrivilegeCheck::NoAccess => "denied",
            PrivilegeCheck::InvalidPriv => "not set",
        };
        println!("member {cid} ({label}): ASSIGN_CLIENT is {verdict}");
    }

    Ok(())
}

async fn run_send() -> CommandResult<()> {
    let fabric = VmciFabric::new(VmciConfig::default());
    let sender = fabric
        .init_context(70, PrivilegeFlags::empty(), 1)
        .to_command_error("initializing sender context", EX_SOFTWARE)?;

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered2 = delivered.clone();
    let endpoint = fabric
        .datagram_create(
            Some(900),
            0,
            PrivilegeFlags::empty(),
            Handle::new(HOST_CONTEXT, 0),
            Arc::new(move |dg: &Datagram| {
                delivered2.fetch_add(dg.payload.len(), Ordering::SeqCst);
            }),
        )
        .to_command_error("creating host endpoint", EX_SOFTWARE)?;

    let dg = Datagram {
        src: Handle::new(sender, 1),
        dst: endpoint,
        payload: b"hello from vmci-ctl".to_vec(),
    };
    let size = fabric
        .datagram_dispatch(sender, dg)
        .to_command_error("dispatching datagram", EX_SOFTWARE)?;
    println!("dispatched {size} wire bytes to host endpoint {endpoint:?}");
    println!("host endpoint observed {} payload bytes", delivered.load(Ordering::SeqCst));

    let name = "vmci-ctl.demo";
    fabric
        .discovery_register(name, endpoint, HOST_CONTEXT)
        .to_command_error("registering discovery name", EX_SOFTWARE)?;

    let response = Arc::new(std::sync::Mutex::new(None));
    let response2 = response.clone();
    let requester = fabric
        .datagram_create(
            None,
            0,
            PrivilegeFlags::empty(),
            Handle::new(sender, 0),
            Arc::new(move |dg: &Datagram| {
                if let Ok(resp) = serde_json::from_slice::<DiscoveryResponse>(&dg.payload) {
                    *response2.lock().unwrap() = Some(resp);
                }
            }),
        )
        .to_command_error("creating reply endpoint", EX_SOFTWARE)?;

    let request = DiscoveryRequest {
        action: DiscoveryAction::Lookup,
        name: name.to_owned(),
        handle: Handle::INVALID,
    };
    let lookup_dg = Datagram {
        src: requester,
        dst: Handle::new(WELL_KNOWN_CONTEXT, vmci_core::discovery::DISCOVERY_WELL_KNOWN_ID),
        payload: serde_json::to_vec(&request).to_command_error("encoding discovery request", EX_SOFTWARE)?,
    };
    fabric
        .datagram_dispatch(sender, lookup_dg)
        .to_command_error("dispatching discovery lookup", EX_SOFTWARE)?;

    match response.lock().unwrap().take() {
        Some(resp) => println!("discovery lookup resolved {name} to {:?}", resp.handle),
        None => println!("discovery lookup produced no response (unexpected)"),
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    vmci_core::diagnostics::init_logging(tracing::Level::WARN);

    match args.command.run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("ERROR: {}", e.message);
            e.exit_code
        }
    }
    .into()
}
