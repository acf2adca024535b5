//! LiveText CLI Client
//!
//! Interactive editor for LiveText servers. Keeps a local replica of the open document,
//! sends local edits and applies the edits of other users as they arrive.
//!
//! # Usage
//!
//! ```bash
//! # Connect to local server
//! livetext
//!
//! # Connect to remote server
//! livetext --host example.com --port 7070
//! ```

mod editor;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use livetext_core::{Alignment, DocumentUri, ListStyle};
use livetext_protocol::{
    encode, AccountCreate, DocumentClose, DocumentCreate, DocumentOpen, DocumentRemove, FrameCodec,
    LoginRequest, Logout, Message, Pong,
};

use crate::editor::{render, Editor, Notice};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const LINE_WIDTH: usize = 72;

/// LiveText Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "livetext")]
#[command(author, version, about = "LiveText CLI - collaborative rich-text editing client")]
struct Args {
    /// Server hostname
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "LIVETEXT_HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "7070", env = "LIVETEXT_PORT")]
    port: u16,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    quiet: bool,
}

/// A parsed REPL line
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Register {
        username: String,
        password: String,
        nickname: Option<String>,
    },
    Login {
        username: String,
        password: String,
    },
    Logout,
    Create(String),
    Open(DocumentUri),
    Remove(DocumentUri),
    Close,
    Docs,
    Insert(usize, String),
    Delete(usize, usize),
    Bold(usize),
    Align(usize, Alignment),
    List(usize, usize, Option<ListStyle>),
    Show,
    Help,
    Clear,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();
    let index = |i: usize| -> Result<usize> {
        let arg = args.get(i).ok_or_else(|| anyhow!("missing argument {}", i + 1))?;
        arg.parse().with_context(|| format!("not an index: {}", arg))
    };
    let arg = |i: usize| -> Result<String> {
        args.get(i)
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("missing argument {}", i + 1))
    };

    let command = match word.to_lowercase().as_str() {
        "register" => Command::Register {
            username: arg(0)?,
            password: arg(1)?,
            nickname: args.get(2).map(|s| s.to_string()),
        },
        "login" => Command::Login {
            username: arg(0)?,
            password: arg(1)?,
        },
        "logout" => Command::Logout,
        "create" if !rest.is_empty() => Command::Create(rest.to_string()),
        "create" => bail!("usage: create <name>"),
        "open" => Command::Open(DocumentUri::new(arg(0)?)?),
        "remove" => Command::Remove(DocumentUri::new(arg(0)?)?),
        "close" => Command::Close,
        "docs" => Command::Docs,
        "insert" => {
            // Text runs to the end of the line, inner spaces included; `\n` breaks a paragraph.
            let (_, text) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: insert <index> <text>"))?;
            Command::Insert(index(0)?, text.replace("\\n", "\n"))
        }
        "delete" => Command::Delete(index(0)?, if args.len() > 1 { index(1)? } else { 1 }),
        "bold" => Command::Bold(index(0)?),
        "align" => Command::Align(index(0)?, arg(1)?.parse::<Alignment>().map_err(|e| anyhow!(e))?),
        "list" => {
            let style = match arg(2)?.as_str() {
                "none" => None,
                other => Some(other.parse::<ListStyle>().map_err(|e| anyhow!(e))?),
            };
            Command::List(index(0)?, index(1)?, style)
        }
        "show" => Command::Show,
        "help" => Command::Help,
        "clear" => Command::Clear,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{}', type 'help'", other),
    };
    Ok(command)
}

/// Writing half of the server connection
struct Connection {
    stream: TcpStream,
}

impl Connection {
    fn open(addr: &str) -> Result<(Self, Receiver<Message>)> {
        let stream =
            TcpStream::connect(addr).with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || read_frames(reader, tx));
        Ok((Self { stream }, rx))
    }

    fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        let frame = encode(&message.into())?;
        self.stream.write_all(&frame)?;
        Ok(())
    }
}

/// Decode frames off the socket until it closes
fn read_frames(mut stream: TcpStream, tx: Sender<Message>) {
    let mut codec = FrameCodec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        codec.feed(&buf[..n]);
        loop {
            match codec.decode() {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    eprintln!("{} {}", "Protocol error:".red(), e);
                    return;
                }
            }
        }
    }
}

struct Client {
    conn: Connection,
    incoming: Receiver<Message>,
    editor: Editor,
}

impl Client {
    /// Handle everything already received
    fn drain(&mut self) -> Result<()> {
        loop {
            match self.incoming.try_recv() {
                Ok(message) => {
                    self.notify(message)?;
                }
                Err(mpsc::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::TryRecvError::Disconnected) => bail!("connection lost"),
            }
        }
    }

    /// Handle incoming messages until the reply to a request arrives
    fn await_reply(&mut self) -> Result<()> {
        loop {
            let message = match self.incoming.recv_timeout(REPLY_TIMEOUT) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => bail!("no reply from server"),
                Err(RecvTimeoutError::Disconnected) => bail!("connection lost"),
            };
            if is_reply(&self.notify(message)?) {
                return Ok(());
            }
        }
    }

    fn notify(&mut self, message: Message) -> Result<Notice> {
        let notice = self.editor.handle(message);
        match &notice {
            Notice::LoggedIn(user) => {
                let line = format!(
                    "Logged in as {} ({}), user id {}",
                    user.nickname, user.username, user.user_id
                );
                println!("{}", line.green());
            }
            Notice::LoggedOut => println!("{}", "Logged out.".green()),
            Notice::Opened(meta) => {
                println!("{}", format!("Opened '{}' [{}]", meta.name, meta.uri).green());
                self.show();
            }
            Notice::Dismissed(uri) => println!("{}", format!("Removed {}", uri).green()),
            Notice::Rejected(reason) => println!("{} {}", "Error:".red(), reason),
            Notice::Edited => println!("{}", "(document updated by a collaborator)".dimmed()),
            Notice::PeerJoined(nickname) => println!("{}", format!("{} joined", nickname).yellow()),
            Notice::PeerLeft(nickname) => println!("{}", format!("{} left", nickname).yellow()),
            Notice::Pinged => self.conn.send(Pong)?,
            Notice::Failure(reason) => {
                println!("{} {}", "Server closed the session:".red(), reason)
            }
            Notice::Quiet => {}
        }
        Ok(notice)
    }

    fn run(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Register {
                username,
                password,
                nickname,
            } => {
                self.conn.send(AccountCreate {
                    nickname: nickname.unwrap_or_else(|| username.clone()),
                    username,
                    icon: Vec::new(),
                    password,
                })?;
                self.await_reply()?;
            }
            Command::Login { username, password } => {
                self.conn.send(LoginRequest { username, password })?;
                self.await_reply()?;
            }
            Command::Logout => {
                self.conn.send(Logout)?;
                self.await_reply()?;
            }
            Command::Create(name) => {
                self.conn.send(DocumentCreate { name })?;
                self.await_reply()?;
            }
            Command::Open(uri) => {
                self.conn.send(DocumentOpen { uri })?;
                self.await_reply()?;
            }
            Command::Remove(uri) => {
                self.conn.send(DocumentRemove { uri })?;
                self.await_reply()?;
            }
            Command::Close => match self.editor.close() {
                Some(uri) => {
                    self.conn.send(DocumentClose)?;
                    println!("{}", format!("Closed {}", uri).green());
                }
                None => println!("{}", "No open document.".yellow()),
            },
            Command::Docs => match self.editor.user() {
                Some(user) if user.documents.is_empty() => {
                    println!("{}", "(no documents)".dimmed())
                }
                Some(user) => {
                    for (i, uri) in user.documents.iter().enumerate() {
                        println!("{}) {}", i + 1, uri);
                    }
                }
                None => println!("{}", "Not logged in.".yellow()),
            },
            Command::Insert(index, text) => {
                for message in self.editor.insert(index, &text)? {
                    self.conn.send(message)?;
                }
            }
            Command::Delete(index, count) => {
                if let Some(message) = self.editor.delete(index, count)? {
                    self.conn.send(message)?;
                }
            }
            Command::Bold(index) => {
                let message = self.editor.toggle_bold(index)?;
                self.conn.send(message)?;
            }
            Command::Align(index, alignment) => {
                let message = self.editor.align(index, alignment)?;
                self.conn.send(message)?;
            }
            Command::List(start, end, style) => {
                for message in self.editor.toggle_list(start, end, style)? {
                    self.conn.send(message)?;
                }
            }
            Command::Show => self.show(),
            Command::Help => print_help(),
            Command::Clear => print!("\x1B[2J\x1B[1;1H"),
            Command::Quit => {
                if self.editor.close().is_some() {
                    let _ = self.conn.send(DocumentClose);
                }
                let _ = self.conn.send(Logout);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn show(&self) {
        let Some(open) = self.editor.open_document() else {
            println!("{}", "No open document.".yellow());
            return;
        };
        println!("{}", format!("── {} ──", open.meta.name).cyan());
        if !open.peers.is_empty() {
            let names: Vec<String> = open
                .peers
                .values()
                .map(|peer| match peer.cursor.as_ref().and_then(|c| open.document.index_of(c)) {
                    Some(index) => format!("{} (at {})", peer.nickname, index),
                    None => peer.nickname.clone(),
                })
                .collect();
            println!("{}", format!("Editing with: {}", names.join(", ")).dimmed());
        }
        for line in render(&open.document) {
            let prefix = match line.item {
                Some((style, number)) => format!("{} ", list_marker(style, number)),
                None => String::new(),
            };
            let content = format!("{}{}", prefix, line.text);
            let pad = LINE_WIDTH.saturating_sub(content.chars().count());
            let indent = match line.alignment {
                Alignment::Left | Alignment::Justify => 0,
                Alignment::Center => pad / 2,
                Alignment::Right => pad,
            };
            println!("{}{}", " ".repeat(indent), content);
        }
        println!("{}", format!("({} characters)", open.document.len()).dimmed());
    }
}

fn is_reply(notice: &Notice) -> bool {
    matches!(
        notice,
        Notice::LoggedIn(_)
            | Notice::LoggedOut
            | Notice::Opened(_)
            | Notice::Dismissed(_)
            | Notice::Rejected(_)
            | Notice::Failure(_)
    )
}

fn list_marker(style: ListStyle, number: usize) -> String {
    match style {
        ListStyle::Disc => "•".to_string(),
        ListStyle::Circle => "◦".to_string(),
        ListStyle::Square => "▪".to_string(),
        ListStyle::Decimal => format!("{}.", number),
        ListStyle::LowerAlpha => format!("{}.", alpha(number)),
        ListStyle::UpperAlpha => format!("{}.", alpha(number).to_uppercase()),
        ListStyle::LowerRoman => format!("{}.", roman(number).to_lowercase()),
        ListStyle::UpperRoman => format!("{}.", roman(number)),
    }
}

/// 1 -> a, 26 -> z, 27 -> aa
fn alpha(mut number: usize) -> String {
    let mut out = Vec::new();
    while number > 0 {
        number -= 1;
        out.push(b'a' + (number % 26) as u8);
        number /= 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn roman(mut number: usize) -> String {
    const NUMERALS: [(usize, &str); 13] = [
        (1000, "M"),
        (900, "CM"),
        (500, "D"),
        (400, "CD"),
        (100, "C"),
        (90, "XC"),
        (50, "L"),
        (40, "XL"),
        (10, "X"),
        (9, "IX"),
        (5, "V"),
        (4, "IV"),
        (1, "I"),
    ];
    let mut out = String::new();
    for (value, numeral) in NUMERALS {
        while number >= value {
            out.push_str(numeral);
            number -= value;
        }
    }
    out
}

fn main() -> Result<()> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let (conn, incoming) = Connection::open(&addr)?;
    let mut client = Client {
        conn,
        incoming,
        editor: Editor::new(),
    };

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  LiveText CLI
  Connected to {}
  Type 'help' for commands, 'quit' to exit
"#,
                addr
            )
            .cyan()
        );
    }

    let mut rl = DefaultEditor::new()?;
    let history_path = home_dir().map(|p| p.join(".livetext_history")).unwrap_or_default();
    let _ = rl.load_history(&history_path);

    loop {
        if let Err(e) = client.drain() {
            eprintln!("{} {}", "Error:".red(), e);
            break;
        }

        let prompt = match client.editor.open_document() {
            Some(open) => format!("{}> ", open.meta.name.green()),
            None => format!("{}> ", "livetext".green()),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                let command = match parse_command(line) {
                    Ok(command) => command,
                    Err(e) => {
                        eprintln!("{} {}", "Error:".red(), e);
                        continue;
                    }
                };
                match client.run(command) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("{} {}", "Error:".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

fn print_help() {
    println!(
        r#"
{}

{}
  register <username> <password> [nickname]   Create an account and log in
  login <username> <password>                  Log in
  logout                                       Log out

{}
  create <name>                                Create a document and open it
  open <uri>                                   Open a document
  remove <uri>                                 Remove a document from your list
  close                                        Close the open document
  docs                                         List your documents

{}
  insert <index> <text>                        Insert text ('\n' breaks a paragraph)
  delete <index> [count]                       Delete characters
  bold <index>                                 Toggle bold on a character
  align <index> <left|right|center|justify>    Align the paragraph at index
  list <start> <end> <style|none>              Toggle a list over a range
  show                                         Print the document

{}
  help                                         Show this help
  clear                                        Clear screen
  quit/exit                                    Exit CLI

{}
  disc, circle, square, decimal, lower-alpha, upper-alpha, lower-roman, upper-roman
"#,
        "LiveText Commands".cyan().bold(),
        "Account".yellow().bold(),
        "Documents".yellow().bold(),
        "Editing".yellow().bold(),
        "Local".yellow().bold(),
        "List styles".yellow().bold(),
    );
}

fn home_dir() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(std::path::PathBuf::from)
}
