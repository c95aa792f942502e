//! Report delivery by mail.

use anyhow::{anyhow, Context, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::path::Path;

use crate::config::MailSettings;
use crate::error::PipelineError;
use crate::report::Report;

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Clone, Debug, PartialEq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MailAttachment>,
}

/// Mail transport capability.
pub trait MailSender: Send + Sync {
    fn send(&self, mail: &OutgoingMail) -> Result<()>;
}

/// Packages reports for the mail transport.
///
/// The dispatcher never touches the evidence store; whoever owns the store
/// clears it after a successful `send`.
pub struct NotificationDispatcher {
    sender: Box<dyn MailSender>,
    from: String,
    to: Vec<String>,
}

impl NotificationDispatcher {
    pub fn new(sender: Box<dyn MailSender>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            sender,
            from: from.into(),
            to,
        }
    }

    pub fn send(&self, report: &Report) -> Result<(), PipelineError> {
        if self.to.is_empty() {
            return Err(PipelineError::Configuration(
                "no mail recipients configured".to_string(),
            ));
        }
        let attachments = report
            .attachments
            .iter()
            .map(|path| load_attachment(path))
            .collect::<Result<Vec<_>>>()
            .map_err(PipelineError::dispatch)?;

        let mail = OutgoingMail {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: report.subject.clone(),
            body: report.narrative.clone(),
            attachments,
        };
        self.sender.send(&mail).map_err(PipelineError::dispatch)?;
        log::info!(
            "report '{}' sent to {} recipient(s) with {} attachment(s)",
            mail.subject,
            mail.to.len(),
            mail.attachments.len()
        );
        Ok(())
    }
}

fn load_attachment(path: &Path) -> Result<MailAttachment> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read attachment {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("attachment path {} has no file name", path.display()))?;
    Ok(MailAttachment {
        filename,
        content_type: JPEG_CONTENT_TYPE.to_string(),
        bytes,
    })
}

// ----------------------------------------------------------------------------
// SMTP submission (STARTTLS, authenticated)
// ----------------------------------------------------------------------------

pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    /// Build a STARTTLS relay. The password is read from the env var named in
    /// the settings.
    pub fn from_settings(settings: &MailSettings) -> Result<Self, PipelineError> {
        let password = std::env::var(&settings.password_env)
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| PipelineError::MissingCredential(settings.password_env.clone()))?;
        let username = if settings.username.is_empty() {
            settings.from.clone()
        } else {
            settings.username.clone()
        };

        let transport = SmtpTransport::starttls_relay(&settings.smtp_host)
            .map_err(|err| {
                PipelineError::Configuration(format!(
                    "invalid SMTP relay {}: {}",
                    settings.smtp_host, err
                ))
            })?
            .port(settings.smtp_port)
            .credentials(Credentials::new(username, password))
            .timeout(Some(settings.timeout))
            .build();
        Ok(Self { transport })
    }
}

impl MailSender for SmtpMailer {
    fn send(&self, mail: &OutgoingMail) -> Result<()> {
        let message = build_message(mail)?;
        self.transport
            .send(&message)
            .context("SMTP submission failed")?;
        Ok(())
    }
}

fn build_message(mail: &OutgoingMail) -> Result<Message> {
    let from: Mailbox = mail
        .from
        .parse()
        .with_context(|| format!("invalid sender address '{}'", mail.from))?;
    let mut builder = Message::builder().from(from).subject(mail.subject.clone());
    for to in &mail.to {
        let mailbox: Mailbox = to
            .parse()
            .with_context(|| format!("invalid recipient address '{}'", to))?;
        builder = builder.to(mailbox);
    }

    let mut body = MultiPart::mixed().singlepart(SinglePart::plain(mail.body.clone()));
    for attachment in &mail.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .map_err(|err| anyhow!("invalid content type {}: {}", attachment.content_type, err))?;
        body = body.singlepart(
            Attachment::new(attachment.filename.clone())
                .body(attachment.bytes.clone(), content_type),
        );
    }

    builder.multipart(body).context("failed to assemble report mail")
}
