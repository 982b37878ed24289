use crate::binding::{redact, BindingCoordinator};
use crate::client::PushClient;
use crate::cloud::CloudClient;
use crate::config::Config;
use crate::connection::TlsConnector;
use crate::events::{EventBridge, LogSink};
use crate::host::HostContext;
use crate::registration::RegistrationIdentity;
use crate::vault::Vault;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        return match command.as_str() {
            "config-init" => handle_config_init(),
            "vault-set" => handle_vault_set(&Config::load_unchecked()?),
            "vault-list" => handle_vault_list(&Config::load_unchecked()?),
            "devices" => handle_devices(&Config::load()?).await,
            other => Err(format!(
                "unknown command '{other}' (expected config-init, vault-set, vault-list or devices)"
            )
            .into()),
        };
    }

    let config = Config::load()?;
    let mut vault = Vault::open(config.vault.path.as_deref())?;
    let cloud = Arc::new(build_cloud_client(&config, &vault)?);

    if cloud.current_session_token().is_none() {
        cloud.login().await?;
    } else {
        tracing::info!("reusing cached control-plane session");
    }
    persist_session(&cloud, &mut vault);

    match cloud.device_list().await {
        Ok(devices) => {
            tracing::info!(count = devices.len(), "device list loaded");
            for device in &devices {
                tracing::info!(uid = %device.uid, name = %device.name, "device");
            }
        }
        Err(err) => tracing::warn!(error = %err, "device list unavailable"),
    }
    persist_session(&cloud, &mut vault);

    let coordinator = Arc::new(BindingCoordinator::new(cloud.clone()));
    let bridge = EventBridge::new(
        config.device_uid(),
        Arc::new(LogSink::new(config.output.json_lines)),
    );
    let (host_handle, host) = HostContext::new(coordinator.clone(), bridge);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let host_task = tokio::spawn(host.run(shutdown_rx));

    let (push_host, push_port) = config.push_endpoint();
    let identity = RegistrationIdentity::new(config.device.imei.as_deref());
    let client = PushClient::new(TlsConnector::new(push_host, push_port), &identity, host_handle)?;
    client.start();
    tracing::info!(
        region = %config.account.region,
        device_uid = config.device_uid().as_deref().unwrap_or("*"),
        "push bridge running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        state = %client.state(),
        push_token = %client.push_token().as_deref().map(redact).unwrap_or_default(),
        bound = coordinator.bound_token().is_some(),
        "shutdown: ctrl-c"
    );
    client.stop().await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = host_task.await {
        tracing::warn!(error = %err, "host context ended abnormally");
    }

    // Binding may have logged in again while running.
    persist_session(&cloud, &mut vault);
    Ok(())
}

fn build_cloud_client(config: &Config, vault: &Vault) -> Result<CloudClient, Box<dyn std::error::Error>> {
    let password = vault.retrieve(&config.account.password_key).map_err(|err| {
        format!(
            "{err}; store the account password with `vault-set {} <password>`",
            config.account.password_key
        )
    })?;

    let session = vault.load_session().map(|mut session| {
        if session.user_id.is_none() {
            session.user_id = config.device.user_id.clone();
        }
        session
    });

    Ok(CloudClient::builder(config.api_base_url(), &config.account.username, password)
        .timeout(config.api_timeout())
        .session(session)
        .build()?)
}

/// Writes the client's session to the vault when it differs from the cached one.
fn persist_session(cloud: &CloudClient, vault: &mut Vault) {
    let Some(session) = cloud.session() else {
        return;
    };
    if vault.load_session().as_ref() == Some(&session) {
        return;
    }
    match vault.store_session(&session) {
        Ok(()) => tracing::info!(path = %vault.path().display(), "control-plane session saved"),
        Err(err) => tracing::warn!(error = %err, "failed to save control-plane session"),
    }
}

async fn handle_devices(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut vault = Vault::open(config.vault.path.as_deref())?;
    let cloud = build_cloud_client(config, &vault)?;
    let devices = cloud.device_list().await?;
    persist_session(&cloud, &mut vault);
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

fn handle_vault_set(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key (usage: vault-set <key> <value>)")?;
    let value = args.next().ok_or("missing value (usage: vault-set <key> <value>)")?;

    let mut vault = Vault::open(config.vault.path.as_deref())?;
    vault.store(&key, &value)?;

    println!("Stored vault key: {}", key);
    Ok(())
}

fn handle_vault_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::open(config.vault.path.as_deref())?;
    for key in vault.list_keys() {
        println!("{}", key);
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
