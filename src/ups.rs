use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::NutError;

// upsd speaks newline terminated ASCII lines.
const TERMINATOR: char = '\n';
const SEPARATOR: char = ' ';
const QUOTE: char = '"';
const ESCAPE: char = '\\';

/// Variables reported by upsd, in the order it sent them.
pub type Telemetry = IndexMap<String, String>;

/// Opens connections to upsd.
pub trait NutClient {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn NutConnection>, NutError>;
}

/// One open connection to upsd.
pub trait NutConnection {
    fn list_vars(&mut self, ups: &str) -> Result<Telemetry, NutError>;
    fn list_commands(&mut self, ups: &str) -> Result<Vec<String>, NutError>;
    fn set_username(&mut self, username: &str) -> Result<(), NutError>;
    fn set_password(&mut self, password: &str) -> Result<(), NutError>;
    fn run_command(&mut self, ups: &str, command: &str) -> Result<(), NutError>;
    fn close(&mut self) -> Result<(), NutError>;
}

/// Blocking TCP client for the subset of the NUT network protocol the bridge uses.
pub struct TcpClient {
    timeout: Duration,
}

impl TcpClient {
    pub fn new(timeout: Duration) -> TcpClient {
        TcpClient { timeout }
    }
}

impl NutClient for TcpClient {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn NutConnection>, NutError> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    debug!(%addr, "connected to upsd");
                    return Ok(Box::new(Upsd::new(stream)?));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => NutError::Io(e),
            None => NutError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} did not resolve", host),
            )),
        })
    }
}

pub struct Upsd {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Upsd {
    fn new(stream: TcpStream) -> Result<Upsd, NutError> {
        Ok(Upsd {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        })
    }

    fn send_command(&mut self, cmd: &str) -> Result<(), NutError> {
        self.writer.write_all(format!("{}{}", cmd, TERMINATOR).as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn get_response(&mut self, request: &str) -> Result<String, NutError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(NutError::Closed);
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if let Some(code) = line.strip_prefix("ERR ") {
            return Err(NutError::Refused {
                request: request.to_string(),
                code: code.to_string(),
            });
        }
        Ok(line)
    }

    /// Sends a request that upsd answers with a single `OK` line.
    fn send_and_confirm(&mut self, request: &str, shown: &str) -> Result<(), NutError> {
        self.send_command(request)?;
        let line = self.get_response(shown)?;
        if line == "OK" || line.starts_with("OK ") {
            Ok(())
        } else {
            Err(NutError::Malformed {
                request: shown.to_string(),
                line,
            })
        }
    }

    /// Runs `LIST <kind> <ups>` and returns the words of every line between BEGIN and END.
    fn send_and_split(&mut self, kind: &str, ups: &str) -> Result<Vec<Vec<String>>, NutError> {
        let request = format!("LIST {} {}", kind, quote(ups));
        self.send_command(&request)?;

        let begin = self.get_response(&request)?;
        if begin != format!("BEGIN {}", request) {
            return Err(NutError::Malformed { request, line: begin });
        }

        let end = format!("END {}", request);
        let mut out = Vec::new();
        loop {
            let line = self.get_response(&request)?;
            if line == end {
                return Ok(out);
            }
            match split_words(&line) {
                Some(words) => out.push(words),
                None => return Err(NutError::Malformed { request, line }),
            }
        }
    }
}

impl NutConnection for Upsd {
    fn list_vars(&mut self, ups: &str) -> Result<Telemetry, NutError> {
        let mut vars = Telemetry::new();
        for words in self.send_and_split("VAR", ups)? {
            match <[String; 4]>::try_from(words) {
                Ok([tag, _, name, value]) if tag == "VAR" => {
                    vars.insert(name, value);
                }
                Ok(words) => return Err(malformed_words("LIST VAR", &words)),
                Err(words) => return Err(malformed_words("LIST VAR", &words)),
            }
        }
        Ok(vars)
    }

    fn list_commands(&mut self, ups: &str) -> Result<Vec<String>, NutError> {
        let mut cmds = Vec::new();
        for words in self.send_and_split("CMD", ups)? {
            match <[String; 3]>::try_from(words) {
                Ok([tag, _, name]) if tag == "CMD" => cmds.push(name),
                Ok(words) => return Err(malformed_words("LIST CMD", &words)),
                Err(words) => return Err(malformed_words("LIST CMD", &words)),
            }
        }
        Ok(cmds)
    }

    fn set_username(&mut self, username: &str) -> Result<(), NutError> {
        self.send_and_confirm(&format!("USERNAME {}", quote(username)), "USERNAME")
    }

    fn set_password(&mut self, password: &str) -> Result<(), NutError> {
        // The password is kept out of error messages.
        self.send_and_confirm(&format!("PASSWORD {}", quote(password)), "PASSWORD")
    }

    fn run_command(&mut self, ups: &str, command: &str) -> Result<(), NutError> {
        let request = format!("INSTCMD {} {}", quote(ups), quote(command));
        self.send_and_confirm(&request, &request)
    }

    fn close(&mut self) -> Result<(), NutError> {
        let result = self
            .send_command("LOGOUT")
            .and_then(|_| self.get_response("LOGOUT"))
            .map(|_| ());
        let _ = self.writer.shutdown(Shutdown::Both);
        result
    }
}

fn malformed_words(request: &str, words: &[String]) -> NutError {
    NutError::Malformed {
        request: request.to_string(),
        line: words.join(" "),
    }
}

/// Splits a reply line into words, honouring double quotes and backslash escapes.
fn split_words(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut chars = line.chars();
    let mut word = String::new();
    let mut in_word = false;
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => {
                word.push(chars.next()?);
                in_word = true;
            }
            QUOTE => {
                quoted = !quoted;
                in_word = true;
            }
            SEPARATOR if !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        return None;
    }
    if in_word {
        words.push(word);
    }
    Some(words)
}

/// Quotes an argument when upsd would otherwise split it.
fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([SEPARATOR, QUOTE, ESCAPE]) {
        return arg.to_string();
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push(QUOTE);
    for c in arg.chars() {
        if c == QUOTE || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out.push(QUOTE);
    out
}
