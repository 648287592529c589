use {
    bytes::Bytes,
    clap::{Parser, Subcommand},
    futures::future::join_all,
    log::info,
    pbrpc::{
        testsrv::{OperationRegistry, TestServer},
        *,
    },
    std::{path::PathBuf, time::Duration},
};

const ECHO_INTERFACE_ID: u32 = 20001;
const PROC_ECHO: u32 = 1;

#[derive(Clone, PartialEq, prost::Message)]
struct EchoRequest {
    #[prost(string, tag = "1")]
    text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct EchoResponse {
    #[prost(string, tag = "1")]
    text: String,
}

#[derive(Debug, Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the echo operation
    Serve {
        /// ip:port to listen on
        address: String,
    },
    /// Call the echo operation of a server
    Call {
        /// host:port of the server
        address: String,

        /// Text to send
        text: String,

        /// Number of requests sent at once
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Username sent with the request
        #[arg(long, default_value = "echo")]
        user: String,

        #[command(flatten)]
        ssl: SslArgs,
    },
}

#[derive(Debug, clap::Args)]
struct SslArgs {
    /// Use SSL
    #[arg(long)]
    ssl: bool,

    /// Use Grid SSL (implies --ssl)
    #[arg(long)]
    grid_ssl: bool,

    /// PEM client certificate
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key of the client certificate
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Password of an encrypted --key
    #[arg(long, requires = "key")]
    key_password: Option<String>,

    /// PKCS#12 container with client certificate and key
    #[arg(long, conflicts_with = "cert")]
    pkcs12: Option<PathBuf>,

    /// Password of the --pkcs12 container
    #[arg(long, requires = "pkcs12")]
    pkcs12_password: Option<String>,

    /// PEM bundle of trusted CA certificates, enables verification
    #[arg(long)]
    trusted_certs: Option<PathBuf>,
}

impl SslArgs {
    fn options(&self) -> Option<SslOptions> {
        if !(self.ssl
            || self.grid_ssl
            || self.cert.is_some()
            || self.pkcs12.is_some()
            || self.trusted_certs.is_some())
        {
            return None;
        }
        Some(SslOptions {
            pem_cert_file: self.cert.clone(),
            pem_key_file: self.key.clone(),
            pem_password: self.key_password.clone(),
            pkcs12_file: self.pkcs12.clone(),
            pkcs12_password: self.pkcs12_password.clone(),
            trusted_certs_file: self.trusted_certs.clone(),
            verify_certificates: self.trusted_certs.is_some(),
            use_grid_ssl: self.grid_ssl,
            ..Default::default()
        })
    }
}

fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new(ECHO_INTERFACE_ID);
    registry.register(PROC_ECHO, |request: EchoRequest, data: Bytes| {
        Ok((EchoResponse { text: request.text }, data))
    });
    registry
}

async fn serve(address: &str) -> pbrpc::Result<i32> {
    let mut server = TestServer::bind(address, registry()).await?;
    server.start();
    println!("[*] Ready to accept clients: {}", server.address());

    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT, shutting down gracefully");
    server.stop().await;
    Ok(0)
}

async fn call(
    address: &str,
    text: &str,
    count: usize,
    timeout: Duration,
    user: &str,
    ssl: Option<SslOptions>,
) -> pbrpc::Result<i32> {
    let client = Client::start(ClientOptions {
        request_timeout: timeout,
        ssl,
        ..Default::default()
    })?;
    let creds = UserCredentials::new(user, vec![user.to_owned()]);
    let request = EchoRequest {
        text: text.to_owned(),
    };

    let responses = join_all((0..count).map(|_| {
        client.send_request::<_, EchoResponse>(
            address,
            ECHO_INTERFACE_ID,
            PROC_ECHO,
            &creds,
            &Auth::none(),
            &request,
            Bytes::new(),
        )
    }))
    .await;

    let mut failed = 0;
    for response in responses {
        match response {
            Ok(response) => println!("{}: {}", response.header.call_id, response.message.text),
            Err(e) => {
                eprintln!("Error: {}", e);
                failed += 1;
            }
        }
    }

    client.shutdown().await;
    Ok(if failed == 0 { 0 } else { 1 })
}

async fn echo_main(Cli { command }: Cli) -> pbrpc::Result<i32> {
    match command {
        Command::Serve { address } => serve(&address).await,
        Command::Call {
            address,
            text,
            count,
            timeout,
            user,
            ssl,
        } => {
            call(
                &address,
                &text,
                count,
                Duration::from_secs(timeout),
                &user,
                ssl.options(),
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = echo_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
