use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use qci_bridge_net::{format_clients, start_ws_server, BridgeHub, IncomingCommand, ServerEnvelope};
use qci_core::{
    ComponentKind, CoreConfig, Event, EventPayload, InterfaceStatus, LocalState, NodeRole,
    PatternKind, QuantumInterface, SubscribeOptions, SyncNode,
};
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "qci", about = "Quantum consciousness interface host")]
struct Args {
    /// JSON file with core configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// WebSocket relay port
    #[arg(long, default_value_t = 8787)]
    ws_port: u16,
    /// Do not start the WebSocket relay
    #[arg(long)]
    no_ws: bool,
    /// Override the sync loop interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Level { level: f32, weight: Option<f32> },
    Emit { channel: String, kind: String, weight: Option<f32>, data: JsonValue },
    Gateway { name: String, level: f32 },
    Pattern { kind: PatternKind, complexity: u32, weight: f32, dimensions: u32 },
    Evolve { id: String, score: f32 },
    Theme { name: String },
    Component { kind: ComponentKind, pattern_id: String },
    ComponentEvolve { id: String },
    Entangle { ids: Vec<String> },
    Node { id: String, role: NodeRole, level: Option<f32> },
    Push { id: String, level: f32 },
    Status,
    Nodes,
    Channels,
    History { channel: String, limit: usize },
    WsInfo,
    WsBroadcast { value: JsonValue },
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => CoreConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => CoreConfig::default(),
    };
    if let Some(tick_ms) = args.tick_ms {
        if tick_ms == 0 {
            bail!("--tick-ms must be greater than zero");
        }
        cfg.sync.interval_ms = tick_ms;
    }

    let iface = Arc::new(QuantumInterface::init(cfg).context("failed to initialise interface")?);
    let hub = BridgeHub::new();
    relay_bus_to_hub(&iface, &hub)?;

    let hub_for_metrics = hub.clone();
    iface.start(
        move |metrics| {
            debug!(level = metrics.level, coherence = metrics.coherence, "cli.metrics");
            hub_for_metrics.publish_metrics(metrics);
        },
        |line| println!("{line}"),
    )?;

    if !args.no_ws {
        let addr = format!("0.0.0.0:{}", args.ws_port);
        let hub_for_server = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = start_ws_server(hub_for_server, &addr).await {
                warn!(error = %err, "cli.ws_server_failed");
            }
        });
        if let Some(mut commands) = hub.take_command_receiver() {
            let iface_for_ws = iface.clone();
            tokio::spawn(async move {
                while let Some(command) = commands.recv().await {
                    handle_network_command(command, &iface_for_ws);
                }
            });
        }
    }
    info!(ws = !args.no_ws, port = args.ws_port, "cli.ready");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_command(trimmed) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(err) = run_command(command, &iface, &hub) {
                    eprintln!("error: {err:#}");
                }
            }
            Err(err) => eprintln!("{err}"),
        }
    }

    iface.dispose().await;
    Ok(())
}

/// Forwards every event on every registered channel to connected clients.
fn relay_bus_to_hub(iface: &QuantumInterface, hub: &BridgeHub) -> Result<()> {
    for channel in iface.events().channel_names() {
        let hub = hub.clone();
        iface.events().subscribe(
            &channel,
            move |event: &Event| {
                hub.publish_event(event);
                Ok(())
            },
            SubscribeOptions::default(),
        )?;
    }
    Ok(())
}

fn handle_network_command(command: IncomingCommand, iface: &QuantumInterface) {
    match command {
        IncomingCommand::ConsciousnessUpdate {
            client_id,
            level: Some(level),
            weight,
            ..
        } => {
            let report = iface.emit_level(level, weight);
            debug!(client = client_id, level, delivered = report.delivered, "cli.ws_level");
        }
        IncomingCommand::ConsciousnessUpdate { client_id, data, .. } => {
            println!("WS UPDATE client={client_id} {data}");
        }
        IncomingCommand::Chat { client_id, message } => {
            println!("WS CHAT client={client_id} {message}");
        }
        IncomingCommand::Raw { client_id, value } => {
            println!("WS RAW client={client_id} {value}");
        }
    }
}

fn run_command(command: Command, iface: &QuantumInterface, hub: &BridgeHub) -> Result<()> {
    match command {
        Command::Level { level, weight } => {
            let report = iface.emit_level(level, weight);
            println!("LEVEL delivered={} paired={}", report.delivered, report.paired_delivered);
        }
        Command::Emit {
            channel,
            kind,
            weight,
            mut data,
        } => {
            if kind == "level:update" {
                if let (Some(weight), Some(fields)) = (weight, data.as_object_mut()) {
                    fields.entry("level").or_insert_with(|| json!(weight));
                }
            }
            let payload = EventPayload::from_kind(&kind, data)
                .with_context(|| format!("invalid {kind} payload"))?;
            let report = iface.events().emit(&channel, payload, weight);
            if report.dropped {
                bail!("unknown channel: {channel}");
            }
            println!(
                "EMIT {} delivered={} failed={} paired={}",
                report.event_id.unwrap_or_default(),
                report.delivered,
                report.failed,
                report.paired_delivered
            );
        }
        Command::Gateway { name, level } => {
            iface.emit_gateway(&name, level);
            println!("GATEWAY {name} -> {level:.2}");
        }
        Command::Pattern {
            kind,
            complexity,
            weight,
            dimensions,
        } => {
            let pattern = iface.generate_pattern(kind, complexity, weight, dimensions);
            println!("{}", serde_json::to_string(&pattern)?);
        }
        Command::Evolve { id, score } => {
            let pattern = iface.evolve_pattern(&id, score)?;
            println!(
                "EVOLVED {} -> {} complexity={} weight={:.2}",
                id, pattern.id, pattern.complexity, pattern.weight
            );
        }
        Command::Theme { name } => {
            let theme = iface.set_theme(&name)?;
            println!("THEME {} intensity={:.2}", theme.name, theme.intensity);
        }
        Command::Component { kind, pattern_id } => {
            let component = iface.create_component(kind, &pattern_id)?;
            println!("COMPONENT {}", component.id);
            println!("{}", component.markup);
        }
        Command::ComponentEvolve { id } => {
            let component = iface.evolve_component(&id)?;
            println!("COMPONENT {} -> {} gen={}", id, component.id, component.generation);
        }
        Command::Entangle { ids } => {
            let group = iface.entangle_components(&ids)?;
            println!("ENTANGLED {group} [{}]", ids.join(", "));
        }
        Command::Node { id, role, level } => {
            let initial = level.map(LocalState::with_level).unwrap_or_default();
            let status = iface.register_node(&id, role, initial);
            println!(
                "NODE {id} ({role}) registered; global={:.3} nodes={}",
                status.global_consciousness, status.nodes
            );
        }
        Command::Push { id, level } => {
            let report = iface.push_to_node(&id, LocalState::with_level(level))?;
            println!("PUSH {id} delivered={}", report.delivered);
        }
        Command::Status => print_status(&iface.status()),
        Command::Nodes => {
            let mut nodes = iface.synchronizer().nodes();
            nodes.sort_by(|a, b| a.id.cmp(&b.id));
            if nodes.is_empty() {
                println!("NODES none");
            }
            let now_ms = iface.synchronizer().now_ms();
            for node in &nodes {
                println!("{}", format_node(node, now_ms));
            }
        }
        Command::Channels => {
            for channel in iface.events().status().channels {
                println!(
                    "CHANNEL {} subs={} paired=[{}] history={} resonance={:.2}",
                    channel.name,
                    channel.subscribers,
                    channel.paired.join(","),
                    channel.history,
                    channel.resonance
                );
            }
        }
        Command::History { channel, limit } => {
            for event in iface.events().history(&channel, limit)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::WsInfo => {
            let clients = hub.list_clients();
            if clients.is_empty() {
                println!("WS no clients connected");
            }
            for line in format_clients(&clients) {
                println!("WS {line}");
            }
        }
        Command::WsBroadcast { value } => {
            hub.broadcast(ServerEnvelope::Event { event: value });
            println!("WS broadcast queued");
        }
        Command::Quit => {}
    }
    Ok(())
}

fn print_status(status: &InterfaceStatus) {
    let sync = &status.sync;
    println!(
        "STATUS level={:.3} patterns={} gateways={} nodes={} reconciliations={}",
        sync.global_consciousness,
        sync.active_patterns.len(),
        sync.gateway_levels.len(),
        sync.nodes,
        sync.reconciliations
    );
    println!(
        "STATUS theme={} generated_patterns={} components={} running={}",
        status.theme, status.patterns, status.components, status.running
    );
    println!(
        "STATUS emitted={} delivered={} failed={}",
        status.events.emitted, status.events.delivered, status.events.failed
    );
}

fn format_node(node: &SyncNode, now_ms: u64) -> String {
    let level = node
        .local
        .level
        .map(|l| format!("{l:.3}"))
        .unwrap_or_else(|| "-".into());
    format!(
        "NODE {} role={} level={} patterns={} last_sync={}ms ago",
        node.id,
        node.role,
        level,
        node.local.patterns.len(),
        now_ms.saturating_sub(node.last_sync_ms)
    )
}

/// Splits off the first whitespace-delimited token.
fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.split_once(char::is_whitespace) {
        Some((head, rest)) => Some((head, rest.trim_start())),
        None => Some((input, "")),
    }
}

fn parse_f32(raw: &str, what: &str) -> Result<f32> {
    raw.parse::<f32>()
        .map_err(|_| anyhow!("{what} expects a number, got {raw}"))
}

fn parse_command(line: &str) -> Result<Command> {
    let (cmd, rest) = next_token(line).ok_or_else(|| anyhow!("empty command"))?;
    let args: Vec<&str> = rest.split_whitespace().collect();
    let command = match cmd {
        ":quit" | ":q" => Command::Quit,
        ":status" => Command::Status,
        ":nodes" => Command::Nodes,
        ":channels" => Command::Channels,
        ":history" => {
            let channel = args.first().ok_or_else(|| anyhow!("usage: :history <channel> [n]"))?;
            let limit = match args.get(1) {
                Some(raw) => raw
                    .parse::<usize>()
                    .map_err(|_| anyhow!(":history expects a count, got {raw}"))?,
                None => 10,
            };
            Command::History {
                channel: channel.to_string(),
                limit,
            }
        }
        ":ws" => match next_token(rest) {
            None | Some(("info", _)) => Command::WsInfo,
            Some(("broadcast", payload)) if !payload.is_empty() => Command::WsBroadcast {
                value: serde_json::from_str(payload).context("invalid broadcast json")?,
            },
            Some(("broadcast", _)) => bail!("usage: :ws broadcast <json>"),
            Some((other, _)) => bail!("unknown ws subcommand: {other}"),
        },
        "level" => {
            let level = args.first().ok_or_else(|| anyhow!("usage: level <v> [w]"))?;
            Command::Level {
                level: parse_f32(level, "level")?,
                weight: args.get(1).map(|w| parse_f32(w, "weight")).transpose()?,
            }
        }
        "emit" => parse_emit(rest)?,
        "gateway" => match args.as_slice() {
            [name, level] => Command::Gateway {
                name: name.to_string(),
                level: parse_f32(level, "gateway level")?,
            },
            _ => bail!("usage: gateway <name> <v>"),
        },
        "pattern" => {
            let kind = args
                .first()
                .ok_or_else(|| anyhow!("usage: pattern <kind> [complexity] [weight] [dims]"))?
                .parse::<PatternKind>()?;
            let complexity = match args.get(1) {
                Some(raw) => raw
                    .parse::<u32>()
                    .map_err(|_| anyhow!("complexity expects an integer, got {raw}"))?,
                None => 3,
            };
            let weight = match args.get(2) {
                Some(raw) => parse_f32(raw, "weight")?,
                None => 0.5,
            };
            let dimensions = match args.get(3) {
                Some(raw) => raw
                    .parse::<u32>()
                    .map_err(|_| anyhow!("dims expects an integer, got {raw}"))?,
                None => 2,
            };
            Command::Pattern {
                kind,
                complexity,
                weight,
                dimensions,
            }
        }
        "evolve" => match args.as_slice() {
            [id, score] => Command::Evolve {
                id: id.to_string(),
                score: parse_f32(score, "score")?,
            },
            _ => bail!("usage: evolve <id> <score>"),
        },
        "theme" => match args.as_slice() {
            [name] => Command::Theme {
                name: name.to_string(),
            },
            _ => bail!("usage: theme <name>"),
        },
        "component" => match args.as_slice() {
            [kind, pattern_id] => Command::Component {
                kind: kind.parse::<ComponentKind>()?,
                pattern_id: pattern_id.to_string(),
            },
            _ => bail!("usage: component <kind> <pattern_id>"),
        },
        "cevolve" => match args.as_slice() {
            [id] => Command::ComponentEvolve { id: id.to_string() },
            _ => bail!("usage: cevolve <component_id>"),
        },
        "entangle" => {
            if args.len() < 2 {
                bail!("usage: entangle <id> <id>...");
            }
            Command::Entangle {
                ids: args.iter().map(|s| s.to_string()).collect(),
            }
        }
        "node" => match args.as_slice() {
            [id, role, rest @ ..] if rest.len() <= 1 => Command::Node {
                id: id.to_string(),
                role: role.parse::<NodeRole>().map_err(|err| anyhow!(err))?,
                level: rest.first().map(|l| parse_f32(l, "level")).transpose()?,
            },
            _ => bail!("usage: node <id> <role> [level]"),
        },
        "push" => match args.as_slice() {
            [id, level] => Command::Push {
                id: id.to_string(),
                level: parse_f32(level, "level")?,
            },
            _ => bail!("usage: push <id> <level>"),
        },
        other => bail!("Unknown command: {other}"),
    };
    Ok(command)
}

/// `emit <channel> <kind> [weight] [json]`; the json tail may contain spaces.
fn parse_emit(rest: &str) -> Result<Command> {
    const USAGE: &str = "usage: emit <channel> <kind> [weight] [json]";
    let (channel, rest) = next_token(rest).ok_or_else(|| anyhow!(USAGE))?;
    let (kind, rest) = next_token(rest).ok_or_else(|| anyhow!(USAGE))?;
    let (weight, tail) = match next_token(rest) {
        Some((token, tail)) => match token.parse::<f32>() {
            Ok(weight) => (Some(weight), tail),
            Err(_) => (None, rest),
        },
        None => (None, ""),
    };
    let data = if tail.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(tail.trim()).context("invalid event json")?
    };
    Ok(Command::Emit {
        channel: channel.to_string(),
        kind: kind.to_string(),
        weight,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_with_optional_weight() {
        assert_eq!(
            parse_command("level 0.8").unwrap(),
            Command::Level {
                level: 0.8,
                weight: None
            }
        );
        assert_eq!(
            parse_command("level 0.8 0.3").unwrap(),
            Command::Level {
                level: 0.8,
                weight: Some(0.3)
            }
        );
        assert!(parse_command("level high").is_err());
    }

    #[test]
    fn parses_emit_with_json_tail() {
        assert_eq!(
            parse_command(r#"emit sync:webapp ping 0.4 {"a": 1, "b": [2, 3]}"#).unwrap(),
            Command::Emit {
                channel: "sync:webapp".into(),
                kind: "ping".into(),
                weight: Some(0.4),
                data: json!({ "a": 1, "b": [2, 3] }),
            }
        );
        assert_eq!(
            parse_command(r#"emit sync:webapp ping {"a":1}"#).unwrap(),
            Command::Emit {
                channel: "sync:webapp".into(),
                kind: "ping".into(),
                weight: None,
                data: json!({ "a": 1 }),
            }
        );
        assert!(parse_command("emit sync:webapp").is_err());
    }

    #[test]
    fn parses_pattern_defaults() {
        assert_eq!(
            parse_command("pattern mandala").unwrap(),
            Command::Pattern {
                kind: PatternKind::Mandala,
                complexity: 3,
                weight: 0.5,
                dimensions: 2
            }
        );
        assert!(parse_command("pattern hexagon").is_err());
    }

    #[test]
    fn parses_node_and_entangle() {
        assert_eq!(
            parse_command("node web-1 webapp 0.4").unwrap(),
            Command::Node {
                id: "web-1".into(),
                role: NodeRole::Webapp,
                level: Some(0.4)
            }
        );
        assert!(parse_command("node web-1 toaster").is_err());
        assert_eq!(
            parse_command("entangle card-0001 panel-0002").unwrap(),
            Command::Entangle {
                ids: vec!["card-0001".into(), "panel-0002".into()]
            }
        );
        assert!(parse_command("entangle card-0001").is_err());
    }

    #[test]
    fn parses_shell_commands() {
        assert_eq!(parse_command(":status").unwrap(), Command::Status);
        assert_eq!(parse_command(":quit").unwrap(), Command::Quit);
        assert_eq!(
            parse_command(":history consciousness:shift 5").unwrap(),
            Command::History {
                channel: "consciousness:shift".into(),
                limit: 5
            }
        );
        assert_eq!(parse_command(":ws").unwrap(), Command::WsInfo);
        assert_eq!(
            parse_command(r#":ws broadcast {"hello": "world"}"#).unwrap(),
            Command::WsBroadcast {
                value: json!({ "hello": "world" })
            }
        );
        assert!(parse_command(":ws teleport").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn commands_drive_the_interface() {
        let iface = QuantumInterface::init(CoreConfig::default()).unwrap();
        let hub = BridgeHub::new();
        run_command(parse_command("level 0.95 0.95").unwrap(), &iface, &hub).unwrap();
        assert_eq!(iface.status().sync.global_consciousness, 0.95);
        run_command(parse_command("pattern spiral 2 0.4").unwrap(), &iface, &hub).unwrap();
        assert_eq!(iface.status().patterns, 1);
        assert!(run_command(parse_command("emit nowhere ping").unwrap(), &iface, &hub).is_err());
        assert!(run_command(parse_command("push ghost 0.2").unwrap(), &iface, &hub).is_err());
    }

    #[test]
    fn typed_emit_reaches_the_synchronizer() {
        let iface = QuantumInterface::init(CoreConfig::default()).unwrap();
        let hub = BridgeHub::new();
        let emit = parse_command("emit consciousness:shift level:update 0.95").unwrap();
        run_command(emit, &iface, &hub).unwrap();
        assert_eq!(iface.status().sync.global_consciousness, 0.95);

        let emit = parse_command(r#"emit consciousness:shift level:update 0.9 {"level": 0.3}"#).unwrap();
        run_command(emit, &iface, &hub).unwrap();
        assert_eq!(iface.status().sync.global_consciousness, 0.3);

        let emit = parse_command(r#"emit gateway:activation gateway:shift {"gateway": "heart"}"#).unwrap();
        assert!(run_command(emit, &iface, &hub).is_err());

        let emit = parse_command(r#"emit consciousness:shift ui:ripple {"x": 1}"#).unwrap();
        run_command(emit, &iface, &hub).unwrap();
        assert_eq!(iface.status().sync.global_consciousness, 0.3);
    }

    #[test]
    fn non_finite_node_levels_are_zeroed() {
        let iface = QuantumInterface::init(CoreConfig::default()).unwrap();
        let hub = BridgeHub::new();
        run_command(parse_command("node web-1 webapp NaN").unwrap(), &iface, &hub).unwrap();
        run_command(parse_command("push web-1 inf").unwrap(), &iface, &hub).unwrap();
        let node = iface.synchronizer().node("web-1").unwrap();
        assert_eq!(node.local.level, Some(0.0));
        let level = iface.status().sync.global_consciousness;
        assert!((0.0..=1.0).contains(&level));
    }
}
