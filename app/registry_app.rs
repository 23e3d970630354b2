use std::collections::BTreeMap;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use registry_replication::adapter::AdapterRegistry;
use registry_replication::container_specs::ACCEPTED_MANIFEST_TYPES;
use registry_replication::config::Settings;
use registry_replication::engine::adapter_context;
use registry_replication::model::{Credential, Decoration, Filter, RegistryType, Target};
use registry_replication::registry::ManifestStore;

// cargo run --bin registry-app -- --url https://registry-1.docker.io --type docker-hub tags --repository library/alpine

#[derive(Parser, Debug)]
#[clap(name = "registry app")]
struct Opt {
    #[clap(long)]
    url: String,

    #[clap(long = "type", default_value = "docker-registry")]
    registry_type: String,

    #[clap(long, env = "REGISTRY_USERNAME")]
    username: Option<String>,

    #[clap(long, env = "REGISTRY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[clap(long)]
    insecure: bool,

    /// Adapter options as key=value, for example region=cn-beijing.
    #[clap(long = "option")]
    options: Vec<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    Catalog {
        #[clap(long, default_value_t = 100)]
        page_size: usize,
    },
    Tags {
        #[clap(long)]
        repository: String,
    },
    ManifestExists {
        #[clap(long)]
        repository: String,
        #[clap(long)]
        reference: String,
    },
    Manifest {
        #[clap(long)]
        repository: String,
        #[clap(long)]
        reference: String,
    },
    /// List repositories and tags the way a policy with these filters would see them.
    Artifacts {
        #[clap(long)]
        name: Option<String>,
        #[clap(long)]
        tag: Option<String>,
        #[clap(long)]
        exclude_tag: Option<String>,
    },
}

impl Opt {
    fn target(&self) -> Result<Target, anyhow::Error> {
        let credential = match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some(Credential {
                access_key: u.clone(),
                access_secret: p.clone(),
            }),
            (None, None) => None,
            _ => bail!("--username and --password have to be given together"),
        };
        let mut options = BTreeMap::new();
        for o in self.options.iter() {
            match o.split_once('=') {
                Some((k, v)) => options.insert(k.to_string(), v.to_string()),
                None => bail!("Option '{}' is not in the form key=value", o),
            };
        }
        Ok(Target {
            id: 0,
            name: "cli".to_string(),
            registry_type: self.registry_type.parse::<RegistryType>()?,
            url: self.url.clone(),
            insecure: self.insecure,
            credential,
            options,
            health: Default::default(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let opt = Opt::parse();
    let target = opt.target()?;
    let adapters = AdapterRegistry::with_defaults(adapter_context(&Settings::default()));
    let adapter = adapters
        .create(&target)
        .with_context(|| format!("Building a {} adapter for {}", target.registry_type, target.url))?;

    match &opt.command {
        Command::Ping => {
            println!("{}", adapter.health_check().await);
        }
        Command::Catalog { page_size } => {
            let mut names = adapter.registry().catalog(*page_size);
            while let Some(name) = names.next().await {
                println!("{}", name?);
            }
        }
        Command::Tags { repository } => {
            for tag in adapter.list_tags(repository).await? {
                println!("{}", tag);
            }
        }
        Command::ManifestExists {
            repository,
            reference,
        } => match adapter.registry().manifest_exist(repository, reference).await? {
            Some(digest) => println!("{}", digest),
            None => bail!("{}:{} does not exist", repository, reference),
        },
        Command::Manifest {
            repository,
            reference,
        } => {
            let manifest = adapter
                .registry()
                .pull_manifest(repository, reference, ACCEPTED_MANIFEST_TYPES)
                .await?;
            eprintln!("{} {}", manifest.media_type, manifest.digest);
            println!("{}", String::from_utf8_lossy(&manifest.payload));
        }
        Command::Artifacts {
            name,
            tag,
            exclude_tag,
        } => {
            let mut filters = Vec::new();
            if let Some(pattern) = name {
                filters.push(Filter::Name {
                    pattern: pattern.clone(),
                });
            }
            if let Some(pattern) = tag {
                filters.push(Filter::Tag {
                    pattern: pattern.clone(),
                    decoration: Decoration::Matches,
                });
            }
            if let Some(pattern) = exclude_tag {
                filters.push(Filter::Tag {
                    pattern: pattern.clone(),
                    decoration: Decoration::Excludes,
                });
            }
            adapter.info().check_filters(&filters)?;
            for resource in adapter.fetch_artifacts(&filters).await? {
                println!("{}: {}", resource.repository, resource.tags().join(", "));
            }
        }
    }

    Ok(())
}
