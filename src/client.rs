use anyhow::{Context, Result, bail};
use chrono::Local;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::select;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::cli::ClientArgs;
use crate::engine::events::{GroupSummary, InboundMessage, Message, MessageKind, UserSummary};
use crate::web::rest_api::{OnlineUsers, StatusReply};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Private { to: String, text: String },
    Group { group: String, text: String },
    CreateGroup(String),
    JoinGroup(String),
    MyGroups,
    ListUsers,
    Search(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
/pm <user> <message>      -- private message
/group <group> <message>  -- send to group
/create_group <group>     -- create group
/join_group <group>       -- join group
/my_groups                -- list of your groups
/list_users               -- list of online users
/search <query>           -- find users
/quit                     -- leave";

/// Parse one input line. `Err` carries the text to show the user.
pub fn parse_command(line: &str) -> Result<ClientCommand, String> {
    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let target_and_text = |usage: &str| -> Result<(String, String), String> {
        match rest.split_once(char::is_whitespace) {
            Some((target, text)) if !text.trim().is_empty() => {
                Ok((target.to_string(), text.trim().to_string()))
            }
            _ => Err(format!("usage {}", usage)),
        }
    };
    let single = |usage: &str| -> Result<String, String> {
        match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
            [arg] => Ok(arg.to_string()),
            _ => Err(format!("usage {}", usage)),
        }
    };

    match command {
        "/pm" => {
            let (to, text) = target_and_text("/pm <user> <message>")?;
            Ok(ClientCommand::Private { to, text })
        }
        "/group" => {
            let (group, text) = target_and_text("/group <group> <message>")?;
            Ok(ClientCommand::Group { group, text })
        }
        "/create_group" => single("/create_group <group>").map(ClientCommand::CreateGroup),
        "/join_group" => single("/join_group <group>").map(ClientCommand::JoinGroup),
        "/my_groups" => Ok(ClientCommand::MyGroups),
        "/list_users" => Ok(ClientCommand::ListUsers),
        "/search" if !rest.is_empty() => Ok(ClientCommand::Search(rest.to_string())),
        "/search" => Err("usage /search <query>".into()),
        "/help" => Ok(ClientCommand::Help),
        "/quit" => Ok(ClientCommand::Quit),
        _ => Err("unknown command".into()),
    }
}

/// Format an incoming message for the terminal.
pub fn render_message(message: &Message) -> String {
    let ts = message.sent_at.with_timezone(&Local).format("%H:%M:%S");
    match message.kind {
        MessageKind::Private => format!("[{}][PM][{} -> you]: {}", ts, message.from, message.text),
        MessageKind::Group => format!(
            "[{}][GROUP {}][{}]: {}",
            ts, message.to, message.from, message.text
        ),
        MessageKind::Connect => format!("[{}][{}]: {}", ts, message.from, message.text),
    }
}

/// Map an `http(s)://` base URL to the WebSocket endpoint.
pub fn websocket_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };
    format!("{}/ws", ws_base)
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

/// REST half of the client.
struct Api {
    http: reqwest::Client,
    base: String,
}

impl Api {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<StatusReply> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?;
        Ok(response.json().await?)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let api = Api::new(&args.server);

    println!("Welcome to Parley!");
    println!("1) Register");
    println!("2) Login");
    let choice = prompt(&mut stdin, "Choose: ").await?;
    let username = prompt(&mut stdin, "Enter username: ").await?;
    let password = prompt(&mut stdin, "Enter password: ").await?;

    let credentials = Credentials {
        username: &username,
        password: &password,
    };
    let path = match choice.as_str() {
        "1" => "/api/register",
        "2" => "/api/login",
        other => bail!("unknown choice {:?}", other),
    };
    let reply = api.post(path, &credentials).await?;
    if !reply.ok {
        bail!("{}", reply.message);
    }
    println!("{}", reply.message);

    let ws_url = websocket_url(&args.server);
    let (socket, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect to {}", ws_url))?;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let hello = serde_json::to_string(&InboundMessage::connect(username.clone()))?;
    ws_sender.send(WsMessage::text(hello)).await?;
    debug!(%username, "chat stream established");

    println!();
    println!("{}", HELP);

    loop {
        select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Message>(text.as_str()) {
                    Ok(message) => println!("{}", render_message(&message)),
                    Err(e) => warn!(error = %e, "unreadable message from server"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            println!("*** server closed the connection: {}", frame.reason)
                        }
                        _ => println!("*** server closed the connection"),
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "connection error");
                    break;
                }
                None => break,
            },
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(ClientCommand::Quit) => {
                        println!("*** leaving chat");
                        break;
                    }
                    Ok(command) => {
                        if let Err(e) = execute(&api, &mut ws_sender, &username, command).await {
                            println!("error: {:#}", e);
                        }
                    }
                    Err(usage) => println!("{}", usage),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = ws_sender.close().await {
        warn!(error = %e, "failed to close connection cleanly");
    }
    Ok(())
}

async fn execute<S>(api: &Api, ws: &mut S, me: &str, command: ClientCommand) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    match command {
        ClientCommand::Private { to, text } => {
            let frame = serde_json::to_string(&InboundMessage::private(me, to, text))?;
            ws.send(WsMessage::text(frame)).await?;
        }
        ClientCommand::Group { group, text } => {
            let frame = serde_json::to_string(&InboundMessage::group(me, group, text))?;
            ws.send(WsMessage::text(frame)).await?;
        }
        ClientCommand::CreateGroup(group) => {
            let body = serde_json::json!({ "group_name": group, "members": [me] });
            let reply = api.post("/api/groups", &body).await?;
            if !reply.ok {
                bail!(reply.message);
            }
            println!("Group '{}' created and you've joined it!", group);
        }
        ClientCommand::JoinGroup(group) => {
            let body = serde_json::json!({ "username": me });
            let reply = api.post(&format!("/api/groups/{}/members", group), &body).await?;
            if !reply.ok {
                bail!(reply.message);
            }
            println!("joined group: {}", group);
        }
        ClientCommand::MyGroups => {
            let groups: Vec<GroupSummary> = api.get(&format!("/api/users/{}/groups", me)).await?;
            if groups.is_empty() {
                println!("You haven't joined any groups yet.");
            } else {
                println!("Your groups ({}):", groups.len());
                for group in groups {
                    println!("  - {} ({} members)", group.name, group.members.len());
                }
            }
        }
        ClientCommand::ListUsers => {
            let online: OnlineUsers = api.get("/api/users/online").await?;
            if online.users.is_empty() {
                println!("No users online.");
            } else {
                println!("Online users ({}):", online.count);
                for user in online.users {
                    if user == me {
                        println!("  - {} (you)", user);
                    } else {
                        println!("  - {}", user);
                    }
                }
            }
        }
        ClientCommand::Search(query) => {
            let url = reqwest::Url::parse_with_params(
                &format!("{}/api/users/search", api.base),
                &[("q", query.as_str())],
            )?;
            let found: Vec<UserSummary> = api
                .http
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if found.is_empty() {
                println!("No users match {:?}.", query);
            }
            for user in found {
                let status = if user.is_online { "online" } else { "offline" };
                println!("  - {} ({})", user.username, status);
            }
        }
        ClientCommand::Help => println!("{}", HELP),
        ClientCommand::Quit => {}
    }
    Ok(())
}

async fn prompt(stdin: &mut Lines<BufReader<Stdin>>, label: &str) -> Result<String> {
    use std::io::Write;

    print!("{}", label);
    std::io::stdout().flush()?;
    match stdin.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => bail!("input closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_parse_private_and_group() {
        assert_eq!(
            parse_command("/pm bob hello there"),
            Ok(ClientCommand::Private {
                to: "bob".into(),
                text: "hello there".into()
            })
        );
        assert_eq!(
            parse_command("/group rust  meeting at 5 "),
            Ok(ClientCommand::Group {
                group: "rust".into(),
                text: "meeting at 5".into()
            })
        );
        assert!(parse_command("/pm bob").is_err());
        assert!(parse_command("/group").is_err());
    }

    #[test]
    fn test_parse_group_management() {
        assert_eq!(
            parse_command("/create_group rust"),
            Ok(ClientCommand::CreateGroup("rust".into()))
        );
        assert_eq!(
            parse_command("/join_group rust"),
            Ok(ClientCommand::JoinGroup("rust".into()))
        );
        assert!(parse_command("/create_group").is_err());
        assert!(parse_command("/join_group a b").is_err());
        assert_eq!(parse_command("/my_groups"), Ok(ClientCommand::MyGroups));
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse_command("/list_users"), Ok(ClientCommand::ListUsers));
        assert_eq!(
            parse_command("/search ali ce"),
            Ok(ClientCommand::Search("ali ce".into()))
        );
        assert!(parse_command("/search").is_err());
        assert_eq!(parse_command("/quit"), Ok(ClientCommand::Quit));
        assert_eq!(parse_command("hello"), Err("unknown command".into()));
    }

    #[test]
    fn test_render_message() {
        let pm = InboundMessage::private("alice", "bob", "hi").stamp("alice", Utc::now());
        let line = render_message(&pm);
        assert!(line.starts_with('['));
        assert!(line.ends_with("][PM][alice -> you]: hi"));

        let group = InboundMessage::group("carol", "rust", "yo").stamp("carol", Utc::now());
        assert!(render_message(&group).ends_with("][GROUP rust][carol]: yo"));
    }

    #[test]
    fn test_websocket_url() {
        assert_eq!(websocket_url("http://127.0.0.1:50051"), "ws://127.0.0.1:50051/ws");
        assert_eq!(websocket_url("https://chat.example/"), "wss://chat.example/ws");
        assert_eq!(websocket_url("localhost:1"), "ws://localhost:1/ws");
    }
}
