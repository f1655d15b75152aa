//! A minimal terminal client for AoNET.
//!
//! Connect, handshake, authenticate, then run a receiver loop alongside
//! a stdin input loop, with `/join <channel>`, `/dm <user> <text>` and
//! `/quit` commands. A thin demonstration of `aonet-protocol`/
//! `aonet-crypto` usage rather than a tested component.

use std::io::Write as _;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use aonet_crypto::{KeyExchange, SecureChannel};
use aonet_protocol::{self as protocol, Message, MessageType};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: aonet-demo-client HOST PORT");
        std::process::exit(1);
    }
    let host = &args[1];
    let port: u16 = match args[2].parse() {
        Ok(p) => p,
        Err(_) => {
            eprintln!("invalid port: {}", args[2]);
            std::process::exit(1);
        }
    };

    print!("Username: ");
    std::io::stdout().flush().ok();
    let mut username = String::new();
    std::io::stdin().read_line(&mut username).ok();
    let username = username.trim().to_string();
    if username.is_empty() {
        eprintln!("[!] username required");
        std::process::exit(1);
    }

    if let Err(e) = run(host, port, &username).await {
        eprintln!("[!] {e}");
    }
    println!("[*] client cleanup complete");
}

async fn run(host: &str, port: u16, username: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("[*] connecting to {host}:{port}...");
    let stream = TcpStream::connect((host, port)).await?;
    println!("[\u{2713}] connected");

    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);

    println!("[*] starting handshake...");
    let mut key_exchange = KeyExchange::new();
    let our_pubkey = key_exchange.public_bytes();
    send_plain(&mut write, MessageType::Hi, our_pubkey.to_vec()).await?;

    let server_hi = read_record(&mut read).await?;
    let server_hi = protocol::decode(&server_hi)?;
    if server_hi.msg_type != MessageType::Hi {
        return Err(format!("expected HI, got {:?}", server_hi.msg_type).into());
    }
    if server_hi.body.len() != 32 {
        return Err("server HI payload was not 32 bytes".into());
    }
    let mut server_pub = [0u8; 32];
    server_pub.copy_from_slice(&server_hi.body);

    let shared_key = key_exchange.derive_shared_key(&server_pub);
    let mut secure_channel = SecureChannel::new();
    secure_channel.initialize(shared_key);
    println!("[\u{2713}] handshake complete");

    println!("[*] authenticating as '{username}'...");
    send_encrypted(&mut write, &secure_channel, MessageType::Auth, username.as_bytes().to_vec()).await?;

    let reply = read_record(&mut read).await?;
    let reply = decode_encrypted(&secure_channel, &reply)?;
    match reply.msg_type {
        MessageType::AuthOk => {
            println!("[\u{2713}] {}", String::from_utf8_lossy(&reply.body));
        }
        MessageType::AuthFail => {
            println!("[!] auth failed: {}", String::from_utf8_lossy(&reply.body));
            return Ok(());
        }
        other => return Err(format!("expected AUTH_OK/AUTH_FAIL, got {other:?}").into()),
    }

    let write = std::sync::Arc::new(tokio::sync::Mutex::new(write));
    let secure_channel = std::sync::Arc::new(secure_channel);

    let recv_channel = std::sync::Arc::clone(&secure_channel);
    let receiver = tokio::spawn(async move {
        receive_loop(read, recv_channel).await;
    });

    let input = input_loop(write, secure_channel);

    tokio::select! {
        _ = receiver => {}
        _ = input => {}
    }

    Ok(())
}

async fn receive_loop(mut read: BufReader<OwnedReadHalf>, secure_channel: std::sync::Arc<SecureChannel>) {
    loop {
        let record = match read_record(&mut read).await {
            Ok(r) => r,
            Err(_) => {
                println!("\n[!] server disconnected");
                break;
            }
        };
        let msg = match decode_encrypted(&secure_channel, &record) {
            Ok(m) => m,
            Err(e) => {
                println!("\n[!] bad record from server: {e}");
                continue;
            }
        };

        let text = String::from_utf8_lossy(&msg.body);
        match msg.msg_type {
            MessageType::Text => println!("\r{text}\n>>> "),
            MessageType::Dm => println!("\r[DM: {text}]\n>>> "),
            MessageType::Online => println!("\r[+] {text}\n>>> "),
            MessageType::Offline => println!("\r[-] {text}\n>>> "),
            MessageType::Sup => println!("\r{text}\n>>> "),
            _ => {}
        }
        std::io::stdout().flush().ok();
    }
}

async fn input_loop(
    write: std::sync::Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    secure_channel: std::sync::Arc<SecureChannel>,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!(">>> ");
        std::io::stdout().flush().ok();

        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            _ => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" || line == "/q" {
            println!("[*] disconnecting...");
            break;
        } else if let Some(channel) = line.strip_prefix("/join ").or_else(|| line.strip_prefix("/j ")) {
            let mut write = write.lock().await;
            let _ = send_encrypted(&mut write, &secure_channel, MessageType::Sup, channel.trim().as_bytes().to_vec()).await;
        } else if let Some(rest) = line.strip_prefix("/dm ") {
            if let Some((user, text)) = rest.split_once(' ') {
                let payload = format!("{user}:{text}");
                let mut write = write.lock().await;
                let _ = send_encrypted(&mut write, &secure_channel, MessageType::Dm, payload.into_bytes()).await;
            } else {
                println!("usage: /dm username message");
            }
        } else if line == "/clear" || line == "/cl" {
            print!("\x1b[2J\x1b[3J\x1b[1;1H");
            std::io::stdout().flush().ok();
        } else if line.starts_with('/') {
            println!("[!] unknown command: {line}");
        } else {
            let mut write = write.lock().await;
            let _ = send_encrypted(&mut write, &secure_channel, MessageType::Text, line.as_bytes().to_vec()).await;
        }
    }
}

async fn read_record<R: tokio::io::AsyncRead + Unpin>(read: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read.read_exact(&mut len_buf).await?;
    let len = protocol::framing::read_length_prefix(len_buf) as usize;
    let mut body = vec![0u8; len];
    read.read_exact(&mut body).await?;
    Ok(body)
}

async fn send_plain<W: tokio::io::AsyncWrite + Unpin>(
    write: &mut W,
    msg_type: MessageType,
    body: Vec<u8>,
) -> std::io::Result<()> {
    let msg = Message::new(msg_type, body);
    let encoded = protocol::encode(msg.version, msg.msg_type, msg.msg_id, &msg.body);
    let framed = protocol::framing::frame(&encoded);
    write.write_all(&framed).await?;
    write.flush().await
}

async fn send_encrypted<W: tokio::io::AsyncWrite + Unpin>(
    write: &mut W,
    secure_channel: &SecureChannel,
    msg_type: MessageType,
    body: Vec<u8>,
) -> std::io::Result<()> {
    let msg = Message::new(msg_type, body);
    let encoded = protocol::encode(msg.version, msg.msg_type, msg.msg_id, &msg.body);
    let (nonce, ciphertext) = secure_channel
        .encrypt(&encoded)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let mut record = nonce;
    record.extend_from_slice(&ciphertext);
    let framed = protocol::framing::frame(&record);
    write.write_all(&framed).await?;
    write.flush().await
}

fn decode_encrypted(secure_channel: &SecureChannel, record: &[u8]) -> Result<Message, Box<dyn std::error::Error>> {
    if record.len() < 12 {
        return Err("record shorter than a nonce".into());
    }
    let (nonce, ciphertext) = record.split_at(12);
    let plaintext = secure_channel.decrypt(nonce, ciphertext)?;
    Ok(protocol::decode(&plaintext)?)
}
