use chat_client::api::HttpApi;
use chat_client::client::{read_stdin, Client, HELP};
use chat_client::config::Config;
use chat_client::connection::ConnectionManager;
use chat_client::realtime::WsConnector;
use dotenv::dotenv;
use log::info;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    info!("Using API {} and realtime channel {}", config.api_url, config.ws_url);

    let api = HttpApi::new(&config.api_url, &config.session.auth_token);
    let manager = ConnectionManager::new(WsConnector::new(&config.ws_url), config.reconnect);
    let mut client = Client::new(api, manager, config.session.clone());

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = read_stdin(tx).await {
            eprintln!("Input error: {}", e);
        }
    });

    println!("{}", HELP);
    client.run(rx).await?;
    println!("Exiting client...");

    Ok(())
}
