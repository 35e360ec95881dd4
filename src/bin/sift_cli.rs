use std::{
    error::Error,
    io::{self, Write},
    time::Duration,
};

use clap::Parser;
use sift::{
    Client, ClientError, Command,
    cli::{CommandError, print_message},
    prompt,
    protocol::Message,
};

const NOTICE_WAIT: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(default_value = "127.0.0.1:8888")]
    address: String,
}

fn execute(client: &mut Client, cmd: Command) -> Result<Option<Message>, ClientError> {
    let reply = match cmd {
        Command::Exit | Command::Poll => return Ok(None),
        Command::Register {
            name,
            nickname,
            email,
            password,
        } => client.register(&name, &nickname, &email, &password)?,
        Command::Login { email, password } => client.login(&email, &password)?,
        Command::Logout => client.logout()?,
        Command::Query {
            query_type,
            parameters,
        } => client.query(&query_type, parameters)?,
        Command::Metadata(kind) => client.metadata(&kind)?,
    };
    Ok(Some(reply))
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    let mut client = Client::connect(&cli.address)?;
    for notice in client.poll(NOTICE_WAIT)? {
        print_message(&mut stdout, &notice)?;
    }

    loop {
        let cmd = match prompt(stdin.lock(), &mut stdout) {
            Ok(Command::Exit) | Err(CommandError::Eof) => break,
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        let polling = cmd == Command::Poll;
        let reply = match execute(&mut client, cmd) {
            Ok(reply) => reply,
            Err(e) => {
                eprintln!("connection error: {e}");
                break;
            }
        };

        let notices = if polling {
            client.poll(NOTICE_WAIT)?
        } else {
            client.take_notices()
        };
        for notice in &notices {
            print_message(&mut stdout, notice)?;
        }
        if let Some(reply) = reply {
            print_message(&mut stdout, &reply)?;
        }
        stdout.flush()?;
    }

    // The server may already have closed the connection.
    let _ = client.close();
    Ok(())
}
