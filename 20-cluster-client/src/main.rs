use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{info, warn};

use cluster_client::cli::{Cli, Command, ConnectArgs, RecordArgs};
use cluster_client::config::WriteParams;
use cluster_client::protocol::info::CHECK;
use cluster_client::{
    Cluster, ClusterConfig, Policy, Request, Response, ScanOptions, TaskPool, TransactionResult,
    execute_transaction, scan_nodes,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cluster = connect(&cli.connect)?;
    let policy = if cli.connect.timeout_ms == 0 {
        Policy {
            timeout: None,
            ..Policy::default()
        }
    } else {
        Policy::new(Duration::from_millis(cli.connect.timeout_ms))
    };

    match cli.command {
        Command::Nodes => {
            for node in cluster.nodes() {
                let addrs: Vec<String> = node.addrs().iter().map(ToString::to_string).collect();
                println!("{}\t{}", node.name(), addrs.join(","));
            }
            if let Some(n) = cluster.n_partitions() {
                println!("partitions\t{n}");
            }
        }
        Command::Info(args) => {
            let names: Vec<&str> = if args.names.is_empty() {
                CHECK.to_vec()
            } else {
                args.names.iter().map(String::as_str).collect()
            };
            let response = cluster.info(&names).context("info request failed")?;
            for (name, value) in response.iter() {
                println!("{name}\t{value}");
            }
        }
        Command::Get(args) => {
            let bins: Vec<&str> = args.bins.iter().map(String::as_str).collect();
            let request = keyed(&args)?.read(&bins);
            let result = execute_transaction(&cluster, &request, &policy).context("get failed")?;
            print_record(&result);
        }
        Command::Put(args) => {
            let mut request = keyed(&args.record)?.write(args.values);
            WriteParams {
                record_ttl: args.ttl,
                ..WriteParams::default()
            }
            .apply(&mut request);
            let result = execute_transaction(&cluster, &request, &policy).context("put failed")?;
            println!("generation\t{}", result.generation);
        }
        Command::Delete(args) => {
            let request = keyed(&args)?.delete();
            execute_transaction(&cluster, &request, &policy).context("delete failed")?;
            println!("deleted");
        }
        Command::Scan(args) => {
            let mut request = Request::new(&args.namespace);
            if let Some(set) = &args.set {
                request = request.with_set(set);
            }
            let options = ScanOptions {
                percent: args.percent,
                ..ScanOptions::default()
            };
            let request = request.scan(options, args.no_bins);
            let pool = TaskPool::new(args.threads, "scan").context("start scan workers")?;

            let (tx, rx) = bounded::<Response>(256);
            let printer = thread::Builder::new()
                .name("scan-printer".into())
                .spawn(move || {
                    let mut count = 0usize;
                    for record in rx.iter() {
                        let bins: Vec<String> = record
                            .bins()
                            .map(|bin| format!("{}={}", bin.name, bin.value))
                            .collect();
                        let digest = record.digest().map(|d| d.to_string()).unwrap_or_default();
                        println!("{digest}\tgen={}\t{}", record.generation, bins.join(" "));
                        count += 1;
                    }
                    count
                })
                .context("spawn scan printer")?;

            let outcomes = scan_nodes(&cluster, &request, &policy, &pool, &tx);
            drop(tx);
            let printed = printer.join().map_err(|_| anyhow!("scan printer panicked"))?;
            for (node, outcome) in outcomes {
                if let Err(err) = outcome {
                    warn!(node = %node, "scan failed: {err}");
                }
            }
            info!("scanned {printed} records");
        }
    }

    cluster.shutdown();
    Ok(())
}

fn connect(args: &ConnectArgs) -> Result<Cluster> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
            ClusterConfig::from_json(&text).with_context(|| format!("parse config {}", path.display()))?
        }
        None => ClusterConfig::default(),
    };
    if let Some(host) = &args.host {
        config = config.with_host(host.clone(), args.port);
    } else if config.hosts.is_empty() {
        config = config.with_host("127.0.0.1", args.port);
    }

    let cluster = Cluster::new(config).context("create cluster")?;
    if !cluster.settled() {
        cluster.tend_now()?;
    }
    if cluster.node_count() == 0 {
        return Err(anyhow!("no cluster node answered"));
    }
    info!("connected to {} nodes", cluster.node_count());
    Ok(cluster)
}

fn keyed(args: &RecordArgs) -> Result<Request> {
    let key = args.key_value().map_err(|err| anyhow!(err))?;
    let mut request = Request::new(&args.namespace).with_key(key);
    if !args.set.is_empty() {
        request = request.with_set(&args.set);
    }
    Ok(request)
}

fn print_record(result: &TransactionResult) {
    println!("generation\t{}", result.generation);
    println!("ttl\t{}", result.ttl);
    for op in &result.ops {
        println!("{}\t{}", op.bin.name, op.bin.value);
    }
}
