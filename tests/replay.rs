//! Replayed sessions through the synchronous connection driver

use bytes::Bytes;
use linetap::modifier::ModifierPipeline;
use linetap::protocol::pop3::{Pop3Command, Pop3Reply, Pop3Status, Pop3Verb, POP3_AUTH_DATA};
use linetap::protocol::smtp::{SmtpReply, SMTP_COMMAND, SMTP_DATA};
use linetap::{
  Capability, Connection, ConnectionInfo, Direction, Error, FrameRole, Interception, MessageLog, MessageNode,
  Modifier, ModifierDescriptor, ModifierRegistry, Observer, ProtocolRegistry, TrafficEvent, WriteRequest,
};
use std::sync::Arc;

use linetap::Direction::{ClientToServer as Client, ServerToClient as Server};

fn session(activations: &[&str], modifiers: &[ModifierDescriptor]) -> (Connection, Arc<MessageLog>) {
  let pipeline = if modifiers.is_empty() {
    ModifierPipeline::new()
  } else {
    ModifierRegistry::with_defaults()
      .pipeline(modifiers)
      .expect("valid modifiers")
  };
  session_with(activations, pipeline)
}

fn session_with(activations: &[&str], pipeline: ModifierPipeline) -> (Connection, Arc<MessageLog>) {
  let log = Observer::log();
  let protocols = ProtocolRegistry::with_defaults()
    .activate(activations)
    .expect("known activations");
  let interception = Interception::new(protocols, pipeline).with_observer(log.clone());
  let info = ConnectionInfo::new(1, "127.0.0.1:50000", "mail.example.com:110");
  (Connection::new(Arc::new(interception), info), log)
}

fn replay(connection: &mut Connection, steps: &[(Direction, &[u8])]) -> Vec<WriteRequest> {
  let mut writes = Vec::new();
  for (timestamp, (direction, chunk)) in steps.iter().enumerate() {
    writes.extend(connection.on_bytes(*direction, chunk, timestamp as u64));
  }
  writes
}

fn forwarded(writes: &[WriteRequest], direction: Direction) -> Vec<u8> {
  writes
    .iter()
    .filter(|w| w.direction == direction)
    .flat_map(|w| w.bytes.iter().copied())
    .collect()
}

const SPLIT_GREETING: &[(Direction, &[u8])] = &[
  (Server, b"+OK POP3 server re"),
  (Client, b"CAPA\r\n"),
  (Server, b"ady <id>\r\n+OK\r\nUIDL\r\nblubsblab\r\n.\r\n"),
];

#[test]
fn test_split_greeting() {
  let (mut connection, log) = session(&["pop3"], &[]);
  let writes = replay(&mut connection, SPLIT_GREETING);

  let messages = log.messages();
  assert_eq!(messages.len(), 3, "greeting, CAPA and its answer");

  let greeting = messages
    .iter()
    .find(|m| m.has(Capability::GREETING))
    .expect("greeting published");
  assert_eq!(greeting.raw_str(), "+OK POP3 server ready <id>\r\n");
  assert_eq!(greeting.transmission().unwrap().role, FrameRole::Unsolicited);
  assert!(log.pairing_for(greeting).is_none());

  let capa = messages
    .iter()
    .find(|m| m.direction() == Some(Client))
    .expect("command published");
  assert_eq!(Pop3Command::from_node(capa).unwrap().verb, Pop3Verb::Capa);

  let answer = messages.last().unwrap();
  let reply = Pop3Reply::from_node(answer).unwrap();
  assert_eq!(reply.status, Pop3Status::Ok);
  assert_eq!(reply.body.as_deref(), Some(&b"UIDL\r\nblubsblab\r\n"[..]));
  let record = log.pairing_for(answer).expect("CAPA answer paired");
  assert!(Arc::ptr_eq(&record.request, capa));

  assert_eq!(
    forwarded(&writes, Server),
    b"+OK POP3 server ready <id>\r\n+OK\r\nUIDL\r\nblubsblab\r\n.\r\n".to_vec()
  );
  assert_eq!(forwarded(&writes, Client), b"CAPA\r\n".to_vec());
}

#[test]
fn test_quit_overtakes_retr() {
  let (mut connection, log) = session(&["pop3", "mime"], &[]);
  replay(
    &mut connection,
    &[
      (Server, b"+OK ready\r\n"),
      (Client, b"RETR 1\r\nQUIT\r\n"),
      (Server, b"+OK 31 octets\r\nSubject: hi\r\n\r\nhello\r\n.\r\n"),
      (Server, b"+OK bye\r\n"),
    ],
  );

  let messages = log.messages();
  assert_eq!(messages.len(), 5);
  let after_greeting = &messages[1..];
  let requests: Vec<_> = after_greeting
    .iter()
    .filter(|m| m.direction() == Some(Client))
    .collect();
  let responses: Vec<_> = after_greeting
    .iter()
    .filter(|m| m.direction() == Some(Server))
    .collect();
  assert_eq!(requests.len(), 2);
  assert_eq!(responses.len(), 2);

  let first = log.pairing_for(responses[0]).expect("RETR answered");
  assert_eq!(Pop3Command::from_node(&first.request).unwrap().verb, Pop3Verb::Retr);
  let second = log.pairing_for(responses[1]).expect("QUIT answered");
  assert_eq!(Pop3Command::from_node(&second.request).unwrap().verb, Pop3Verb::Quit);
  assert_eq!(
    responses[1].transmission().unwrap().paired_with,
    requests[1].transmission().map(|t| t.sequence)
  );

  let subject = responses[0]
    .find_first("$.pop3Body.mimeHeader.subject")
    .unwrap()
    .expect("message body parsed as MIME");
  assert_eq!(subject.text(), Some("hi"));

  connection.close(10);
  assert!(log.anomalies().is_empty(), "every request was answered");
}

#[test]
fn test_modifiers_rewrite_both_directions() {
  let (mut connection, log) = session(
    &["pop3"],
    &[
      ModifierDescriptor::replace_content("1896.697170952@dbc.mtview.ca.us", "rewritten@example.com"),
      ModifierDescriptor::replace_content("RETR 1", "retr 2"),
    ],
  );
  let writes = replay(
    &mut connection,
    &[
      (Server, b"+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n"),
      (Client, b"RETR 1\r\n"),
    ],
  );

  let greeting = String::from_utf8(forwarded(&writes, Server)).unwrap();
  assert!(greeting.contains("<rewritten@example.com>"));
  assert!(!greeting.contains("1896.697170952@dbc.mtview.ca.us"));
  assert_eq!(forwarded(&writes, Client), b"retr 2\r\n".to_vec());

  let request = log.messages().pop().unwrap();
  assert_eq!(request.raw_str(), "retr 2\r\n");
  assert_eq!(
    request.find_first("$.pop3Arguments").unwrap().unwrap().string_content(),
    "2"
  );
  assert_eq!(Pop3Command::from_node(&request).unwrap().verb, Pop3Verb::Retr);
  assert_eq!(connection.pending_requests(), 1);
}

#[test]
fn test_smtp_session_pairs_every_command() {
  let (mut connection, log) = session(&["smtp", "mime"], &[]);
  replay(
    &mut connection,
    &[
      (Server, b"220 mx.example.com ESMTP\r\n"),
      (Client, b"EHLO client.example.com\r\n"),
      (Server, b"250-mx.example.com\r\n250-SIZE 10240000\r\n250 HELP\r\n"),
      (Client, b"MAIL FROM:<alice@example.com>\r\n"),
      (Server, b"250 OK\r\n"),
      (Client, b"RCPT TO:<bob@example.com>\r\n"),
      (Server, b"250 OK\r\n"),
      (Client, b"DATA\r\n"),
      (Server, b"354 End data with <CR><LF>.<CR><LF>\r\n"),
      (Client, b"Subject: lunch\r\nFrom: alice@example.com\r\n\r\n"),
      (Client, b"..noon?\r\n.\r\n"),
      (Server, b"250 queued\r\n"),
      (Client, b"QUIT\r\n"),
      (Server, b"221 bye\r\n"),
    ],
  );
  connection.close(99);

  let messages = log.messages();
  let requests = messages.iter().filter(|m| m.direction() == Some(Client)).count();
  assert_eq!(requests, 6);
  assert_eq!(log.pairings().len(), 6);
  assert!(log.anomalies().is_empty());

  let ehlo_reply = messages
    .iter()
    .filter_map(|m| SmtpReply::from_node(m).ok())
    .find(|r| r.lines.len() == 3)
    .expect("multi-line EHLO reply");
  assert_eq!(ehlo_reply.code, 250);

  let body = messages.iter().find(|m| m.has(SMTP_DATA)).expect("message body");
  assert_eq!(
    body.find_first("$.smtpBody.mimeHeader.subject").unwrap().unwrap().text(),
    Some("lunch")
  );
  assert_eq!(
    body.child("smtpBody").unwrap().string_content(),
    "Subject: lunch\r\nFrom: alice@example.com\r\n\r\n.noon?\r\n"
  );
}

#[test]
fn test_replay_is_idempotent_and_chunking_invariant() {
  let (mut whole, whole_log) = session(&["pop3"], &[]);
  replay(&mut whole, SPLIT_GREETING);
  let (mut again, again_log) = session(&["pop3"], &[]);
  replay(&mut again, SPLIT_GREETING);
  assert_eq!(whole_log.messages(), again_log.messages());

  let (mut bytewise, bytewise_log) = session(&["pop3"], &[]);
  for (timestamp, (direction, chunk)) in SPLIT_GREETING.iter().enumerate() {
    for byte in chunk.chunks(1) {
      bytewise.on_bytes(*direction, byte, timestamp as u64);
    }
  }
  let trees: Vec<String> = whole_log.messages().iter().map(|m| m.print_tree()).collect();
  let bytewise_trees: Vec<String> = bytewise_log.messages().iter().map(|m| m.print_tree()).collect();
  assert_eq!(trees, bytewise_trees);
}

#[test]
fn test_unparseable_traffic_is_still_forwarded() {
  let (mut connection, log) = session(&["pop3"], &[]);
  let writes = replay(
    &mut connection,
    &[(Server, b"+OK hi\r\n"), (Client, b"\x16\x03\x01garbage\r\n")],
  );
  assert_eq!(forwarded(&writes, Client), b"\x16\x03\x01garbage\r\n".to_vec());
  let last = log.messages().pop().unwrap();
  assert!(last.has(Capability::UNPARSED));
  assert_eq!(last.children().count(), 0);
}

#[test]
fn test_capa_sent_before_the_greeting() {
  let (mut connection, log) = session(&["pop3"], &[]);
  let writes = replay(
    &mut connection,
    &[
      (Client, b"CAPA\r\n"),
      (Server, b"+OK POP3 server re"),
      (Server, b"ady <1896.697170952@dbc.mtview.ca.us>\r\n"),
      (Server, b"+OK\r\n"),
      (Server, b"UIDL\r\n"),
      (Server, b"blubsblab\r\n"),
      (Server, b".\r\n"),
    ],
  );

  let messages = log.messages();
  assert_eq!(messages.len(), 3);
  let capa = &messages[0];
  assert_eq!(Pop3Command::from_node(capa).unwrap().verb, Pop3Verb::Capa);

  let greeting = &messages[1];
  assert!(greeting.has(Capability::GREETING));
  assert_eq!(
    greeting.raw_str(),
    "+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n"
  );
  assert!(log.pairing_for(greeting).is_none());

  let answer = &messages[2];
  assert_eq!(answer.raw_str(), "+OK\r\nUIDL\r\nblubsblab\r\n.\r\n");
  let record = log.pairing_for(answer).expect("CAPA answered");
  assert!(Arc::ptr_eq(&record.request, capa));
  assert_eq!(
    forwarded(&writes, Server),
    b"+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n+OK\r\nUIDL\r\nblubsblab\r\n.\r\n".to_vec()
  );
  assert_eq!(connection.pending_requests(), 0);
}

#[test]
fn test_auth_plain_exchanges() {
  let (mut connection, log) = session(&["pop3"], &[]);
  let writes = replay(
    &mut connection,
    &[
      (Server, b"+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n"),
      (Client, b"AUTH PLAIN\r\n"),
      (Server, b"+ \r\n"),
      (Client, b"dGVzdAB0ZXN0AHRlc3Q=\r\n"),
      (Server, b"+OK Maildrop locked and ready\r\n"),
      (Client, b"AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q=\r\n"),
      (Server, b"+OK Maildrop locked and ready\r\n"),
    ],
  );
  assert_eq!(
    forwarded(&writes, Client),
    b"AUTH PLAIN\r\ndGVzdAB0ZXN0AHRlc3Q=\r\nAUTH PLAIN dGVzdAB0ZXN0AHRlc3Q=\r\n".to_vec()
  );

  let messages = log.messages();
  assert_eq!(messages.len(), 7);
  let requests: Vec<_> = messages.iter().filter(|m| m.direction() == Some(Client)).collect();
  assert_eq!(
    requests.iter().map(|m| m.raw_str()).collect::<Vec<_>>(),
    vec!["AUTH PLAIN\r\n", "dGVzdAB0ZXN0AHRlc3Q=\r\n", "AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q=\r\n"]
  );

  let data = requests[1];
  assert!(data.has(POP3_AUTH_DATA));
  assert_eq!(
    data.find_first("$.pop3AuthData").unwrap().unwrap().string_content(),
    "test\0test\0test"
  );
  let credentials = requests[2]
    .find_first("$.pop3Credentials")
    .unwrap()
    .expect("initial response decoded");
  assert_eq!(credentials.raw_str(), "dGVzdAB0ZXN0AHRlc3Q=");
  for (field, value) in [("authorizationId", "test"), ("authenticationId", "test"), ("password", "test")] {
    assert_eq!(credentials.child(field).unwrap().text(), Some(value));
  }

  let pairings = log.pairings();
  assert_eq!(pairings.len(), 3);
  for (record, request) in pairings.iter().zip(&requests) {
    assert!(Arc::ptr_eq(&record.request, request));
  }
  assert_eq!(
    Pop3Reply::from_node(&pairings[0].response).unwrap().status,
    Pop3Status::Continue
  );
  assert_eq!(
    pairings[1].response.raw_str(),
    "+OK Maildrop locked and ready\r\n"
  );
  assert_eq!(
    pairings[2].response.raw_str(),
    "+OK Maildrop locked and ready\r\n"
  );
  assert!(log.anomalies().is_empty());
}

struct MailboxLocked;

impl Modifier for MailboxLocked {
  fn name(&self) -> &str {
    "MailboxLocked"
  }
  fn apply(&self, _content: &[u8], _node: &MessageNode) -> linetap::Result<Option<Bytes>> {
    Err(Error::modifier("MailboxLocked", "mailbox is locked"))
  }
}

#[test]
fn test_modifier_failures_reach_observers() {
  let mut pipeline = ModifierPipeline::new();
  pipeline.push(Arc::new(MailboxLocked));
  let (mut connection, log) = session_with(&["pop3"], pipeline);
  let writes = replay(&mut connection, &[(Server, b"+OK ready\r\n"), (Client, b"STAT\r\n")]);
  assert_eq!(forwarded(&writes, Client), b"STAT\r\n".to_vec());

  let failures: Vec<_> = log
    .events()
    .into_iter()
    .filter_map(|event| match event {
      TrafficEvent::ModifierFailed {
        connection,
        sequence,
        reason,
      } => Some((connection, sequence, reason)),
      _ => None,
    })
    .collect();
  assert_eq!(failures.len(), 2, "one per forwarded frame");
  assert_eq!(failures[1].0, 1);
  assert_eq!(failures[1].1, 1);
  assert!(failures[1].2.contains("mailbox is locked"));
  let stat = log.messages().pop().unwrap();
  assert_eq!(stat.transmission().unwrap().sequence, 1);
  assert_eq!(Pop3Command::from_node(&stat).unwrap().verb, Pop3Verb::Stat);
}

#[test]
fn test_large_retr_answer_is_paired_once() {
  let (mut connection, log) = session(&["pop3"], &[]);
  let mut answer = b"+OK 2097152 octets\r\n".to_vec();
  while answer.len() < 2 * 1024 * 1024 {
    answer.extend_from_slice(&[b'x'; 62]);
    answer.extend_from_slice(b"\r\n");
  }
  answer.extend_from_slice(b".\r\n");

  let mut writes = replay(&mut connection, &[(Server, b"+OK ready\r\n"), (Client, b"RETR 1\r\n")]);
  for chunk in answer.chunks(8 * 1024) {
    writes.extend(connection.on_bytes(Server, chunk, 2));
  }
  writes.extend(connection.on_bytes(Client, b"QUIT\r\n", 3));
  writes.extend(connection.on_bytes(Server, b"+OK bye\r\n", 4));
  connection.close(5);

  let mut expected = b"+OK ready\r\n".to_vec();
  expected.extend_from_slice(&answer);
  expected.extend_from_slice(b"+OK bye\r\n");
  assert!(forwarded(&writes, Server) == expected, "server bytes forwarded unchanged");

  let messages = log.messages();
  let (fragments, whole): (Vec<_>, Vec<_>) = messages
    .iter()
    .partition(|m| m.transmission().unwrap().role == FrameRole::Fragment);
  assert!(!fragments.is_empty());
  assert_eq!(whole.len(), 5);

  let pairings = log.pairings();
  assert_eq!(pairings.len(), 2);
  assert_eq!(pairings[0].request.raw_str(), "RETR 1\r\n");
  assert!(pairings[0].response.raw().ends_with(b"\r\n.\r\n"));
  assert!(pairings[0].response.has(Capability::UNPARSED));
  assert_eq!(pairings[1].request.raw_str(), "QUIT\r\n");
  assert_eq!(pairings[1].response.raw_str(), "+OK bye\r\n");
  assert!(log.anomalies().is_empty());
}

#[test]
fn test_rejected_data_keeps_commands_flowing() {
  let (mut connection, log) = session(&["smtp"], &[]);
  let writes = replay(
    &mut connection,
    &[
      (Server, b"220 mx.example.com ESMTP\r\n"),
      (Client, b"DATA\r\n"),
      (Server, b"554 No valid recipients\r\n"),
      (Client, b"QUIT\r\n"),
      (Server, b"221 bye\r\n"),
    ],
  );
  assert_eq!(forwarded(&writes, Client), b"DATA\r\nQUIT\r\n".to_vec());

  let pairings = log.pairings();
  assert_eq!(pairings.len(), 2);
  assert_eq!(pairings[0].request.raw_str(), "DATA\r\n");
  assert_eq!(SmtpReply::from_node(&pairings[0].response).unwrap().code, 554);
  assert_eq!(pairings[1].request.raw_str(), "QUIT\r\n");
  assert!(pairings[1].request.has(SMTP_COMMAND));
  assert_eq!(SmtpReply::from_node(&pairings[1].response).unwrap().code, 221);
  assert!(!log.messages().iter().any(|m| m.has(SMTP_DATA)));

  connection.close(9);
  assert!(log.anomalies().is_empty());
}
