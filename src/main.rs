use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{AddrParseError, IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use nix::sys::signal::{signal, SigHandler, Signal};


const DEFAULT_DIRECTORY: &str = "/tmp";
const DEFAULT_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 4221;

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain";

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let server = Server::from_command_line()?;
    let listener = server.create_listener()?;

    // A client that disconnects mid-response must surface as a write error,
    // not a fatal SIGPIPE.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;

    let server = Arc::new(server);

    // main loop: one thread per accepted connection
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                eprintln!("warning: accept() failed: {}", e);
                continue;
            }
        };
        let server = Arc::clone(&server);
        thread::spawn(move || {
            if let Err(e) = handle_connection(&server, stream, addr.ip()) {
                eprintln!("warning: connection from {} failed: {:#}", addr.ip(), e);
            }
        });
    }
}

/// Where to put the access log.
#[derive(Debug)]
enum LogSink {
    Stdout,
    File(BufWriter<File>),
}
impl LogSink {
    fn log(&mut self, message: &str) -> io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Server {
    directory: PathBuf,
    bindaddr: String,
    bindport: u16,
    log_sink: Mutex<LogSink>,
}
impl Server {
    fn from_command_line() -> Result<Self> {
        let mut server = Self {
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            bindaddr: DEFAULT_ADDR.to_string(),
            bindport: DEFAULT_PORT,
            log_sink: Mutex::new(LogSink::Stdout),
        };
        let mut args = std::env::args();
        let name = args.next().expect("expected at least one argument");
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--directory" => {
                    server.directory =
                        PathBuf::from(args.next().context("missing path after --directory")?);
                }
                "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    server.bindport = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                }
                "--addr" => {
                    server.bindaddr = args.next().context("missing ip after --addr")?;
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    server.log_sink = Mutex::new(LogSink::File(BufWriter::new(
                        OpenOptions::new()
                            .append(true)
                            .create(true)
                            .open(&filename)
                            .with_context(|| format!("failed to open log file {}", filename))?,
                    )));
                }
                "--help" => {
                    server.usage(&name);
                    std::process::exit(0);
                }
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }
        Ok(server)
    }
    fn usage(&self, argv0: &str) {
        print!(
            "usage:\t{} [flags]\n\n\
            flags:\t--directory path (default: {})\n\
            \t\tSpecifies the directory to serve /files/ requests from.\n\n\
            \t--port number (default: {})\n\
            \t\tSpecifies which port to listen on for connections.\n\
            \t\tPass 0 to let the system choose any free port for you.\n\n\
            \t--addr ip (default: all)\n\
            \t\tIf multiple interfaces are present, specifies\n\
            \t\twhich one to bind the listening port to.\n\n\
            \t--log filename (default: stdout)\n\
            \t\tSpecifies which file to append the request log to.\n\n",
            argv0, DEFAULT_DIRECTORY, DEFAULT_PORT,
        );
    }
    fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let addr = IpAddr::from_str(&self.bindaddr)?;
        Ok(SocketAddr::new(addr, self.bindport))
    }
    /// Initialize the TcpListener. This is the socket that we accept connections from.
    fn create_listener(&self) -> Result<TcpListener> {
        let socket_addr = self.socket_addr().context("malformed --addr argument")?;
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        println!("listening on: http://{}/", socket_addr);
        Ok(listener)
    }
}

/// A single parsed request. Scoped to one connection, discarded after dispatch.
#[derive(Debug)]
struct Request {
    method: String,
    target: String,
    /// Keyed by lower-cased header name; last value wins on duplicates.
    headers: HashMap<String, String>,
    body: Option<Vec<u8>>,
}

/// Why a byte stream could not be turned into a `Request`.
#[derive(Debug)]
enum RequestError {
    /// The request line had fewer than three tokens.
    Malformed,
    /// The connection closed or errored mid-read.
    Transport(io::Error),
}
impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

impl Request {
    /// Read one request from the stream: request line, headers until the blank
    /// terminator, then a Content-Length-bounded body for POST.
    fn read_from(reader: &mut impl BufRead) -> Result<Self, RequestError> {
        let request_line = read_line(reader)?;
        let mut tokens = request_line.split(' ').filter(|token| !token.is_empty());
        let (method, target) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(target), Some(_protocol)) => {
                (method.to_string(), target.to_string())
            }
            _ => return Err(RequestError::Malformed),
        };

        let mut headers = HashMap::new();
        loop {
            let line = read_line(reader)?;
            if line.is_empty() {
                break; // end of headers
            }
            // Lines without a colon are silently skipped.
            if let Some(colon) = line.find(':') {
                let key = line[..colon].trim().to_lowercase();
                let value = line[colon + 1..].trim().to_string();
                headers.insert(key, value);
            }
        }

        // A missing or unparseable Content-Length means no body, not an error.
        let content_length: usize = headers
            .get("content-length")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        // Never accept fewer bytes than declared; a short read surfaces as a
        // transport error just like a failure in the headers.
        let body = if method == "POST" && content_length > 0 {
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body)?;
            Some(body)
        } else {
            None
        };

        Ok(Self {
            method,
            target,
            headers,
            body,
        })
    }
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }
}

/// Read a newline-terminated line, stripping the terminator and any trailing
/// carriage return. EOF before the terminator is an error.
fn read_line(reader: &mut impl BufRead) -> io::Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-request",
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Classification of (method, target) into one of the fixed routes, computed
/// fresh per request.
#[derive(Debug, PartialEq)]
enum Route<'a> {
    Root,
    Echo(&'a str),
    UserAgent,
    FileGet(&'a str),
    FilePost(&'a str),
    NotFound,
}

/// Ordered dispatch over the four fixed path patterns.
fn route<'a>(method: &str, target: &'a str) -> Route<'a> {
    if target == "/" {
        return Route::Root;
    }
    if let Some(segment) = single_segment(target, "/echo/") {
        return Route::Echo(segment);
    }
    if target == "/user-agent" {
        return Route::UserAgent;
    }
    if let Some(segment) = single_segment(target, "/files/") {
        return match method {
            "GET" => Route::FileGet(segment),
            "POST" => Route::FilePost(segment),
            _ => Route::NotFound,
        };
    }
    Route::NotFound
}

/// Strip `prefix` and capture the remainder as a single non-empty segment.
/// Rejecting embedded slashes also rejects nested paths under /echo/ and
/// /files/.
fn single_segment<'a>(target: &'a str, prefix: &str) -> Option<&'a str> {
    target
        .strip_prefix(prefix)
        .filter(|segment| !segment.is_empty() && !segment.contains('/'))
}

/// An in-memory response, serialized once by `write_to`.
#[derive(Debug)]
struct Response {
    code: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}
impl Response {
    fn new(code: u16, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
    fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
    /// Serialize status line, headers, blank line and body, CRLF-joined, and
    /// send in a single attempt. Content-Length always reflects the actual
    /// body bytes.
    fn write_to(&self, writer: &mut impl Write, now: SystemTime) -> io::Result<()> {
        let mut message = Vec::new();
        write!(message, "HTTP/1.1 {} {}\r\n", self.code, self.reason)?;
        write!(message, "Date: {}\r\n", HttpDate(now))?;
        write!(
            message,
            "Server: {}/{}\r\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )?;
        write!(message, "Connection: close\r\n")?;
        for (name, value) in &self.headers {
            write!(message, "{}: {}\r\n", name, value)?;
        }
        write!(message, "Content-Length: {}\r\n\r\n", self.body.len())?;
        message.extend_from_slice(&self.body);
        writer.write_all(&message)?;
        writer.flush()
    }
}

/// Handle one connection: parse a single request, dispatch, respond, close.
/// Nothing here is fatal to the process.
fn handle_connection(server: &Server, stream: TcpStream, client: IpAddr) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone().context("failed to clone stream")?);
    let mut stream = stream;
    let now = SystemTime::now();

    let request = match Request::read_from(&mut reader) {
        Ok(request) => request,
        Err(RequestError::Malformed) => {
            Response::new(400, "Bad Request")
                .write_to(&mut stream, now)
                .context("failed to write response")?;
            return Ok(());
        }
        Err(RequestError::Transport(e)) => {
            // The socket may already be gone; the 500 is best effort.
            Response::new(500, "Internal Server Error")
                .write_to(&mut stream, now)
                .ok();
            return Err(e).context("failed to read request");
        }
    };

    let response = match route(&request.method, &request.target) {
        Route::Root => Response::new(200, "OK"),
        Route::Echo(segment) => echo_reply(segment, &request),
        Route::UserAgent => user_agent_reply(&request),
        Route::FileGet(segment) => file_get_reply(server, segment),
        Route::FilePost(segment) => {
            file_post_reply(server, segment, request.body.as_deref().unwrap_or(&[]))
        }
        Route::NotFound => not_found_reply(),
    };

    response
        .write_to(&mut stream, now)
        .context("failed to write response")?;
    log_connection(server, client, &request, &response, now);
    Ok(())
}

/// True when the request negotiates gzip: the Accept-Encoding value must be
/// exactly the literal "gzip". No list or weight parsing.
fn accepts_gzip(request: &Request) -> bool {
    request.header("accept-encoding") == Some("gzip")
}

fn gzip_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// GET|* /echo/{seg}: echo the segment back, gzip-compressed if negotiated.
fn echo_reply(segment: &str, request: &Request) -> Response {
    let response = Response::new(200, "OK").with_header("Content-Type", TEXT_PLAIN);
    if accepts_gzip(request) {
        match gzip_compress(segment.as_bytes()) {
            Ok(compressed) => response
                .with_header("Content-Encoding", "gzip")
                .with_body(compressed),
            Err(_) => Response::new(500, "Internal Server Error"),
        }
    } else {
        response.with_body(segment.as_bytes().to_vec())
    }
}

/// * /user-agent: reflect the User-Agent header, empty string if absent.
fn user_agent_reply(request: &Request) -> Response {
    let user_agent = request.header("user-agent").unwrap_or("");
    Response::new(200, "OK")
        .with_header("Content-Type", TEXT_PLAIN)
        .with_body(user_agent.as_bytes().to_vec())
}

/// GET /files/{seg}: serve the named file out of the serving directory, fully
/// read into memory. Not-found is distinguished from every other I/O error.
fn file_get_reply(server: &Server, segment: &str) -> Response {
    if !is_safe_filename(segment) {
        return file_not_found_reply();
    }
    match fs::read(server.directory.join(segment)) {
        Ok(contents) => Response::new(200, "OK")
            .with_header("Content-Type", OCTET_STREAM)
            .with_body(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => file_not_found_reply(),
        Err(_) => Response::new(500, "Internal Server Error"),
    }
}

/// POST /files/{seg}: create or truncate the named file with the request body.
fn file_post_reply(server: &Server, segment: &str, body: &[u8]) -> Response {
    if !is_safe_filename(segment) {
        return file_not_found_reply();
    }
    match fs::write(server.directory.join(segment), body) {
        Ok(()) => Response::new(201, "Created"),
        Err(_) => Response::new(500, "Internal Server Error"),
    }
}

/// The router already forbids embedded slashes, so `.` and `..` are the only
/// segments that can alias or escape the serving directory.
fn is_safe_filename(segment: &str) -> bool {
    !matches!(segment, "." | "..")
}

fn file_not_found_reply() -> Response {
    Response::new(404, "Not Found").with_header("Content-Type", OCTET_STREAM)
}

fn not_found_reply() -> Response {
    Response::new(404, "Not Found").with_header("Content-Type", TEXT_PLAIN)
}

/// RFC1123 formatted date.
struct HttpDate(SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
struct ClfDate(SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
struct LogEncoded<'a>(&'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Add a completed request's details to the access log.
fn log_connection(
    server: &Server,
    client: IpAddr,
    request: &Request,
    response: &Response,
    now: SystemTime,
) {
    let message = format!(
        "{} - - {} \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"\n",
        client,
        ClfDate(now),
        LogEncoded(&request.method),
        LogEncoded(&request.target),
        response.code,
        response.body.len(),
        LogEncoded(request.header("referer").unwrap_or("")),
        LogEncoded(request.header("user-agent").unwrap_or("")),
    );
    let result = server
        .log_sink
        .lock()
        .expect("failed to lock log sink")
        .log(&message);
    if let Err(e) = result {
        eprintln!("warning: failed to write log message: {}", e);
    }
}
