use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use authcode_core::auth::{
    AuthError, AuthorizationCode, BrowserLauncher, ConfiguredLauncher, LoginCoordinator,
    OAuthClient, TokenPair,
};
use authcode_core::config::{AuthorizationConfig, OAuthEndpoints};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(author, version, about = "OAuth2 authorization-code login from the terminal")]
struct Cli {
    #[command(flatten)]
    client: ClientArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in through the browser and print the resulting tokens
    Login(LoginArgs),
    /// Print the authorization URL without starting a listener
    AuthorizeUrl,
    /// Exchange an authorization code obtained elsewhere
    Exchange(ExchangeArgs),
    /// Trade a refresh token for a new token pair
    Refresh(RefreshArgs),
}

/// Client settings. Flags win over `AUTHCODE_*` environment variables.
#[derive(Args, Debug)]
struct ClientArgs {
    /// Application (client) id registered with the provider
    #[arg(long, global = true)]
    client_id: Option<String>,
    /// Client secret for confidential clients
    #[arg(long, global = true)]
    client_secret: Option<String>,
    /// Space separated scopes to request
    #[arg(long, global = true)]
    scope: Option<String>,
    /// Loopback port for the redirect listener (0 picks a free port)
    #[arg(long, global = true)]
    redirect_port: Option<u16>,
    /// Path the provider redirects to
    #[arg(long, global = true)]
    redirect_path: Option<String>,
    /// Program used to open the browser instead of the system default
    #[arg(long, global = true)]
    open_cmd: Option<String>,
    /// Override the authorization endpoint
    #[arg(long, global = true)]
    authorize_url: Option<String>,
    /// Override the token endpoint
    #[arg(long, global = true)]
    token_url: Option<String>,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Only print the authorization URL; do not launch a browser
    #[arg(long)]
    no_browser: bool,
    /// Give up if no redirect arrives within this many seconds (0 waits forever)
    #[arg(long, default_value_t = DEFAULT_LOGIN_TIMEOUT_SECS)]
    timeout_secs: u64,
    /// Print only the authorization code and skip the token exchange
    #[arg(long)]
    code_only: bool,
}

#[derive(Args, Debug)]
struct ExchangeArgs {
    /// Authorization code returned by the provider
    #[arg(long)]
    code: String,
}

#[derive(Args, Debug)]
struct RefreshArgs {
    /// Refresh token from an earlier exchange
    #[arg(long)]
    refresh_token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authcode=info,authcode_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Login(args) => login(&cli.client, args).await?,
        Commands::AuthorizeUrl => authorize_url(&cli.client)?,
        Commands::Exchange(args) => exchange(&cli.client, args).await?,
        Commands::Refresh(args) => refresh(&cli.client, args).await?,
    }
    Ok(())
}

async fn login(client_args: &ClientArgs, args: LoginArgs) -> Result<()> {
    let mut config = build_config(client_args)?;
    if args.timeout_secs > 0 {
        config = config.with_login_timeout(Duration::from_secs(args.timeout_secs));
    }
    let launcher = (!args.no_browser)
        .then(|| ConfiguredLauncher::from_command(config.open_command.as_deref()));
    let client = build_client(client_args, config)?;

    let coordinator = LoginCoordinator::new(client, move |url: &Url| -> Result<(), AuthError> {
        print_authorization_url(url);
        match &launcher {
            Some(launcher) => launcher.open_url(url),
            None => Ok(()),
        }
    });

    if args.code_only {
        let code = coordinator.run_login().await.context("login failed")?;
        println!("{}", code.value());
        return Ok(());
    }

    let tokens = coordinator
        .login_and_exchange()
        .await
        .context("login failed")?;
    info!(scopes = ?tokens.scope, "login complete");
    print_tokens(&tokens)
}

fn authorize_url(client_args: &ClientArgs) -> Result<()> {
    let client = build_client(client_args, build_config(client_args)?)?;
    let url = client
        .authorization_url()
        .context("failed to build authorization URL")?;
    println!("{url}");
    Ok(())
}

async fn exchange(client_args: &ClientArgs, args: ExchangeArgs) -> Result<()> {
    let client = build_client(client_args, build_config(client_args)?)?;
    let code = AuthorizationCode::new(args.code.trim()).context("invalid authorization code")?;
    let tokens = client
        .exchange_code(&code, &client.config().scope())
        .await
        .context("token exchange failed")?;
    print_tokens(&tokens)
}

async fn refresh(client_args: &ClientArgs, args: RefreshArgs) -> Result<()> {
    let client = build_client(client_args, build_config(client_args)?)?;
    let tokens = client
        .refresh_tokens(args.refresh_token.trim(), &client.config().scope())
        .await
        .context("token refresh failed")?;
    print_tokens(&tokens)
}

fn build_client(args: &ClientArgs, config: AuthorizationConfig) -> Result<OAuthClient> {
    let defaults = OAuthEndpoints::default();
    let authorize = setting(&args.authorize_url, "AUTHCODE_AUTHORIZE_URL")
        .unwrap_or_else(|| defaults.authorization_url.to_string());
    let token = setting(&args.token_url, "AUTHCODE_TOKEN_URL")
        .unwrap_or_else(|| defaults.token_url.to_string());
    let endpoints = OAuthEndpoints::new(&authorize, &token)?;
    OAuthClient::with_endpoints(config, endpoints).context("failed to build OAuth client")
}

fn build_config(args: &ClientArgs) -> Result<AuthorizationConfig> {
    let client_id = setting(&args.client_id, "AUTHCODE_CLIENT_ID")
        .context("a client id is required (--client-id or AUTHCODE_CLIENT_ID)")?;
    let mut config = AuthorizationConfig::new(client_id);

    if let Some(secret) = setting(&args.client_secret, "AUTHCODE_CLIENT_SECRET") {
        config = config.with_secret(secret);
    }

    if let Some(scopes) = setting(&args.scope, "AUTHCODE_SCOPES") {
        config = config.with_scopes(scopes.split_whitespace());
    }

    if let Some(port) = setting(&args.redirect_port.map(|p| p.to_string()), "AUTHCODE_REDIRECT_PORT")
    {
        config.redirect_port = port
            .parse()
            .with_context(|| format!("invalid redirect port '{port}'"))?;
    }

    if let Some(path) = setting(&args.redirect_path, "AUTHCODE_REDIRECT_PATH") {
        config.redirect_path = path;
    }

    if let Some(command) = setting(&args.open_cmd, "AUTHCODE_OPEN_CMD") {
        config = config.with_open_command(command);
    }

    config.validate()?;
    Ok(config)
}

/// Flag value if given, else a non-blank environment variable.
fn setting(flag: &Option<String>, var: &str) -> Option<String> {
    flag.clone()
        .or_else(|| env::var(var).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn print_authorization_url(url: &Url) {
    eprintln!("\nAuthorize the application by visiting:\n  {url}\n");
}

fn print_tokens(tokens: &TokenPair) -> Result<()> {
    let json = serde_json::to_string_pretty(tokens)?;
    println!("{json}");
    Ok(())
}
