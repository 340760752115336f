//! Command execution.
//!
//! This module owns the runtime flow for each subcommand: configuration
//! layering, token resolution, component wiring, and the exit-code
//! contract. A fatal error (invalid configuration, unresolvable
//! authentication) bubbles as `Err`; per-step crawl errors are reported in
//! the summary and still exit zero.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use tokio::sync::watch;

use crate::account::{AccountStore, FileAccountStore, UserKey};
use crate::api::AuthState;
use crate::auth::TokenManager;
use crate::callback::InlineCallback;
use crate::cli_args::{
    AccountAddArgs, AccountCommand, AccountRemoveArgs, Cli, Commands, CrawlArgs, GlobalArgs,
};
use crate::config::{Config, Oauth2Provider};
use crate::crawler::{ALL_STEPS, Crawler};
use crate::error::{CrawlError, Result};
use crate::models::{CrawlResult, NewAccount, User};
use crate::output::{ProgressReporter, ResumeStore};

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl(args) => {
            let config = load_config(&cli.global, Some(&args))?;
            let result = crawl(config, &args.steps, None).await?;
            print_summary(&result);
            Ok(())
        }
        Commands::Account(account) => {
            let config = load_config(&cli.global, None)?;
            let store = FileAccountStore::open(&config.database.path)?;
            match account.command {
                AccountCommand::Add(args) => account_add(&store, &args),
                AccountCommand::List => account_list(&store),
                AccountCommand::Remove(args) => account_remove(&store, &args),
            }
        }
    }
}

fn load_config(global: &GlobalArgs, crawl: Option<&CrawlArgs>) -> Result<Config> {
    let mut config = Config::load(global.config.as_deref())?;
    global.apply_to(&mut config);
    if let Some(args) = crawl {
        args.apply_to(&mut config);
    }
    config.validate()?;
    Ok(config)
}

/// Run one crawl session against a validated configuration.
///
/// Exposed for library callers, who may register an inline transform that
/// the configuration surface cannot carry.
pub async fn crawl(
    config: Config,
    selected_steps: &[String],
    inline: Option<InlineCallback>,
) -> Result<CrawlResult> {
    let store: Arc<dyn AccountStore> = Arc::new(FileAccountStore::open(&config.database.path)?);
    let provider = select_provider(&config);
    let manager = Arc::new(TokenManager::new(Arc::clone(&store), provider)?);

    let hint = config.gitlab.account.as_deref();
    let account_id = manager.resolve_account_id(hint);
    // A refresh token supplied through configuration seeds the resolved
    // account so the refresh path can use it.
    if let (Some(refresh_token), Some(account)) = (&config.gitlab.refresh_token, &account_id) {
        store.update_account(
            account,
            crate::models::AccountUpdate {
                refresh_token: Some(refresh_token.clone()),
                ..crate::models::AccountUpdate::default()
            },
        )?;
    }
    let auth = match (&config.gitlab.access_token, &account_id) {
        (Some(token), Some(account)) => {
            AuthState::with_refresh(Some(token.clone()), Arc::clone(&manager), account.clone())
        }
        (Some(token), None) => AuthState::fixed(Some(token.clone())),
        (None, Some(account)) => {
            let token = manager.get_access_token(account).await?;
            if token.is_none() {
                return Err(CrawlError::AuthMissing);
            }
            AuthState::with_refresh(token, Arc::clone(&manager), account.clone())
        }
        (None, None) => return Err(CrawlError::AuthMissing),
    };
    let account_label = account_id.unwrap_or_else(|| "token".to_owned());
    info!(
        "crawling {} as account '{account_label}'",
        config.gitlab.host
    );

    let resume = Arc::new(ResumeStore::load(&config.resume)?);
    let progress = Arc::new(ProgressReporter::new(
        config.progress.clone(),
        resume.session_id(),
        config.gitlab.host.clone(),
    ));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work and checkpointing");
            let _ = cancel_tx.send(true);
        }
    });

    let steps = resolve_steps(&config, selected_steps);
    let crawler = Crawler::new(
        config,
        account_label,
        auth,
        progress,
        resume,
        inline,
        cancel_rx,
    )?;
    Ok(crawler.run(&steps).await)
}

/// The step list to run: explicit CLI selection or all four in order.
pub fn resolve_steps(_config: &Config, selected: &[String]) -> Vec<String> {
    if selected.is_empty() {
        ALL_STEPS.iter().map(|s| (*s).to_string()).collect()
    } else {
        selected.to_vec()
    }
}

/// Pick the OAuth2 provider for the configured host: an entry named after
/// the host's domain, otherwise the sole configured entry.
fn select_provider(config: &Config) -> Option<Oauth2Provider> {
    let providers = &config.oauth2.providers;
    if let Ok(url) = config.host_url()
        && let Some(domain) = url.host_str()
        && let Some(provider) = providers.get(domain)
    {
        return Some(provider.clone());
    }
    if providers.len() == 1 {
        return providers.values().next().cloned();
    }
    None
}

fn print_summary(result: &CrawlResult) {
    println!(
        "crawl {} in {} ms: {} records, {} errors, {} warnings",
        if result.success { "succeeded" } else { "finished with errors" },
        result.total_processing_time_ms,
        result.summary.resources_crawled,
        result.summary.errors,
        result.summary.warnings
    );
    for (resource_type, count) in &result.summary.details {
        println!("  {resource_type}: {count}");
    }
}

fn account_add(store: &FileAccountStore, args: &AccountAddArgs) -> Result<()> {
    let now = Utc::now();
    let user = match store.find_user_by_email(&args.email) {
        Some(user) => user,
        None => store.upsert_user(
            User {
                id: uuid::Uuid::new_v4().to_string(),
                name: args.name.clone(),
                email: args.email.clone(),
                email_verified: false,
                image: None,
                role: None,
                banned: None,
                ban_reason: None,
                ban_expires: None,
                created_at: now,
                updated_at: now,
            },
            UserKey::Email,
        )?,
    };
    let account = store.insert_account(NewAccount {
        account_id: args.account_id.clone(),
        provider_id: args.provider.clone(),
        user_id: user.id,
        access_token: args.access_token.clone(),
        refresh_token: args.refresh_token.clone(),
        access_token_expires_at: args
            .expires_in
            .map(|secs| now + ChronoDuration::seconds(secs)),
        refresh_token_expires_at: None,
        id_token: None,
        scope: None,
    })?;
    store.flush()?;
    println!("added account '{}' for {}", account.account_id, args.email);
    Ok(())
}

fn account_list(store: &FileAccountStore) -> Result<()> {
    let accounts = store.get_accounts_with_users();
    if accounts.is_empty() {
        println!("no accounts stored");
        return Ok(());
    }
    for (account, user) in accounts {
        let tokens = match (&account.access_token, &account.refresh_token) {
            (Some(_), Some(_)) => "access+refresh",
            (Some(_), None) => "access only",
            (None, Some(_)) => "refresh only",
            (None, None) => "no tokens",
        };
        println!(
            "{} ({}) user={} <{}> [{tokens}]",
            account.account_id, account.provider_id, user.name, user.email
        );
    }
    Ok(())
}

fn account_remove(store: &FileAccountStore, args: &AccountRemoveArgs) -> Result<()> {
    let Some(account) = store.find_account_by_account_id(&args.account_id) else {
        return Err(CrawlError::Config(format!(
            "no account named '{}'",
            args.account_id
        )));
    };
    store.delete_account(&account.id)?;
    store.flush()?;
    println!("removed account '{}'", args.account_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{resolve_steps, select_provider};
    use crate::config::{Config, Oauth2Provider};

    #[test]
    fn default_step_list_is_the_full_pipeline() {
        let config = Config::default();
        assert_eq!(
            resolve_steps(&config, &[]),
            vec!["areas", "users", "resources", "repository"]
        );
        let explicit = vec!["users".to_string()];
        assert_eq!(resolve_steps(&config, &explicit), explicit);
    }

    #[test]
    fn provider_matches_host_domain_first() {
        let mut config = Config::default();
        config.gitlab.host = "https://forge.example.com".into();
        config.oauth2.providers.insert(
            "forge.example.com".into(),
            Oauth2Provider {
                client_id: "by-domain".into(),
                ..Oauth2Provider::default()
            },
        );
        config.oauth2.providers.insert(
            "other".into(),
            Oauth2Provider {
                client_id: "other".into(),
                ..Oauth2Provider::default()
            },
        );
        let provider = select_provider(&config).expect("provider");
        assert_eq!(provider.client_id, "by-domain");
    }

    #[test]
    fn sole_provider_is_used_regardless_of_name() {
        let mut config = Config::default();
        config.gitlab.host = "https://forge.example.com".into();
        config.oauth2.providers.insert(
            "anything".into(),
            Oauth2Provider {
                client_id: "solo".into(),
                ..Oauth2Provider::default()
            },
        );
        let provider = select_provider(&config).expect("provider");
        assert_eq!(provider.client_id, "solo");
    }
}
