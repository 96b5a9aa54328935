use anyhow::Context;
use clap::{Parser, Subcommand};

use mindwire::client::AiClient;
use mindwire::config::{Provider, ServiceConfig};
use mindwire::dispatch::{AiRequestParams, Message};

#[derive(Parser, Debug)]
#[command(name = "mindwire")]
#[command(version, about = "Send prompts to cloud or local language models", long_about = None)]
struct Cli {
    /// Route cloud calls through the configured proxy
    #[arg(long, global = true)]
    proxy: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one prompt and print the reply
    Send {
        prompt: String,
        /// openai, anthropic, gemini, qwen, groq or ollama
        #[arg(short, long)]
        provider: Option<Provider>,
        #[arg(short, long)]
        model: Option<String>,
        /// System instruction sent before the prompt
        #[arg(short, long)]
        system: Option<String>,
        #[arg(short, long)]
        temperature: Option<f64>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// List configured and discovered models
    Models,
    /// Check that a provider answers
    Test { provider: Provider },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = ServiceConfig::load();
    if cli.proxy {
        config.use_proxy = true;
    }

    match cli.command {
        Commands::Send {
            prompt,
            provider,
            model,
            system,
            temperature,
            max_tokens,
        } => {
            let provider = provider.unwrap_or(config.default_provider);
            let model = match model {
                Some(m) => m,
                None => default_model_for(&config, provider)
                    .with_context(|| format!("no model given and none configured for {provider}"))?,
            };
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));

            let mut params = AiRequestParams::new(provider, model, messages);
            params.temperature = temperature;
            params.max_tokens = max_tokens;

            let client = AiClient::new(config)?;
            let response = client
                .send_request(params)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("{}", response.text);
            if let Some(usage) = response.usage {
                tracing::info!(
                    request_id = response.request_id,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    total_tokens = usage.total_tokens,
                    "usage"
                );
            }
        }
        Commands::Models => {
            let client = AiClient::new(config)?;
            for model in client.get_available_models().await {
                println!("{:<10} {:<40} {}", model.provider, model.id, model.name);
            }
        }
        Commands::Test { provider } => {
            let client = AiClient::new(config)?;
            if client.test_connection(provider, None, None).await {
                println!("{provider}: ok");
            } else {
                anyhow::bail!("{provider}: no response");
            }
        }
        Commands::Config => {
            println!("{}", config.redacted().to_json()?);
        }
    }

    Ok(())
}

fn default_model_for(config: &ServiceConfig, provider: Provider) -> Option<String> {
    if provider == config.default_provider
        && let Some(model) = &config.default_model
    {
        return Some(model.clone());
    }
    config
        .provider(provider)
        .and_then(|p| p.models.first())
        .map(|m| m.id.clone())
}
