#[macro_use]
extern crate log;

use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::env;
use std::io;

use kad_sim::{FindValueResult, Node};

const BASE_PORT: u16 = 8900;

/// Returns the port of the `id`-th node, or `None` once the ports run out.
fn port_for(id: u32) -> Option<u16> {
    u16::try_from(id).ok().and_then(|id| BASE_PORT.checked_add(id))
}

fn spawn_node(node_map: &BTreeMap<u32, Node>, id: u32, bootstrap: Option<u32>) -> Option<Node> {
    let port = match port_for(id) {
        Some(port) => port,
        None => {
            error!("No port left for node {}", id);
            return None;
        },
    };
    let node = match Node::new("127.0.0.1", port, kad_sim::Config::default()) {
        Ok(node) => node,
        Err(err) => {
            error!("Could not start node on port {}: {}", port, err);
            return None;
        },
    };
    node.join(bootstrap.and_then(|index| node_map.get(&index)).map(Node::contact));
    Some(node)
}

fn main() {
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("Error: could not initialize logger.");

    let initial_count: u32 = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(20);

    let mut node_map = BTreeMap::new();
    let mut id = 0;
    for _ in 0..initial_count {
        let bootstrap = if id == 0 { None } else { Some(0) };
        if let Some(node) = spawn_node(&node_map, id, bootstrap) {
            node_map.insert(id, node);
        }
        id += 1;
    }

    let input = io::stdin();

    loop {
        let mut buffer = String::new();
        println!("Ready for input!");
        match input.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {},
        }
        let args: Vec<&str> = buffer.trim_end().split(' ').collect();
        let index: Option<u32> = args.get(1).and_then(|arg| arg.parse().ok());
        match (args[0], index) {
            ("new", Some(index)) => {
                if let Some(node) = spawn_node(&node_map, id, Some(index)) {
                    node_map.insert(id, node);
                }
                id += 1;
            },
            ("put", Some(index)) if args.len() == 4 => {
                if let Some(node) = node_map.get(&index) {
                    info!("Stored at {} nodes", node.put(args[2], args[3]));
                }
            },
            ("get", Some(index)) if args.len() == 3 => {
                if let Some(node) = node_map.get(&index) {
                    match node.get(args[2]) {
                        FindValueResult::Found(value) => info!("Found {}", value),
                        FindValueResult::NotFound(contacts) => {
                            info!("Not found, closest nodes are {:?}", contacts)
                        },
                    }
                }
            },
            ("leave", Some(index)) => {
                if let Some(node) = node_map.remove(&index) {
                    node.leave();
                }
            },
            ("info", Some(index)) => {
                if let Some(node) = node_map.get(&index) {
                    match serde_json::to_string_pretty(&node.snapshot()) {
                        Ok(json) => println!("{}", json),
                        Err(err) => error!("Could not encode snapshot: {}", err),
                    }
                }
            },
            _ => println!("Commands: new <index>, put <index> <key> <value>, get <index> <key>, leave <index>, info <index>"),
        }
    }

    for node in node_map.values() {
        node.leave();
    }
}
