// SPDX-License-Identifier: AGPL-3.0-or-later

//! Turns consolidated row groups into fully assembled transport payloads: reference tokens are
//! substituted with their artifacts, attachments collected and PDF attachments merged.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::alert::fields::FieldKey;
use crate::alert::{Alert, RowGroup, DEFAULT_FOOTER_PLACEHOLDER};
use crate::config::Configuration;
use crate::errors::AlertError;
use crate::reference::{ContentReference, ReferenceKind, ReferenceRegistry, ScanShape};
use crate::render::RenderFormat;
use crate::transport::{to_e164_list, Attachment, EmailPayload, SmsPayload};

/// Assembles one outgoing email from one row group.
///
/// Address and subject fields are taken from the lead row; grouping only joins rows which agree
/// on all of them. The body is header (once), each row's body in order, then the footer: the last
/// row's footer column when bound, with `VIZALERTS_FOOTER()` occurrences replaced by the
/// generated footer, or just the generated footer.
pub fn assemble_email_group(
    alert: &Alert,
    config: &Configuration,
    group: &RowGroup,
    registry: &ReferenceRegistry,
) -> Result<EmailPayload, AlertError> {
    let lead = group.lead();
    let column = |key: FieldKey| alert.fields.column(key);

    let from = column(FieldKey::EmailFrom)
        .map(|column| lead.value(column))
        .filter(|value| !value.is_empty())
        .unwrap_or(&config.smtp_address_from)
        .to_string();
    let to = column(FieldKey::EmailTo)
        .map(|column| lead.value(column))
        .unwrap_or_default()
        .to_string();
    let cc = column(FieldKey::EmailCc)
        .map(|column| lead.value(column).to_string())
        .filter(|value| !value.is_empty());
    let bcc = column(FieldKey::EmailBcc)
        .map(|column| lead.value(column).to_string())
        .filter(|value| !value.is_empty());
    let subject = column(FieldKey::EmailSubject)
        .map(|column| lead.value(column))
        .unwrap_or_default()
        .to_string();

    let mut body = String::new();
    if let Some(header) = column(FieldKey::EmailHeader) {
        body.push_str(lead.value(header));
    }
    for row in &group.rows {
        if let Some(body_column) = column(FieldKey::EmailBody) {
            body.push_str(row.value(body_column));
        }
    }

    let default_footer = alert.default_footer(config);
    match column(FieldKey::EmailFooter) {
        Some(footer_column) => {
            // Unwrap is safe, groups are never empty
            let footer = group.rows.last().unwrap().value(footer_column);
            body.push_str(&footer.replace(DEFAULT_FOOTER_PLACEHOLDER, &default_footer));
        }
        None => body.push_str(&default_footer),
    }

    let (body, inline_attachments) = substitute_inline(alert, config, body, registry)?;

    let mut appended_attachments = Vec::new();
    if let Some(attachment_column) = column(FieldKey::EmailAttachment) {
        for row in &group.rows {
            collect_attachments(
                row.value(attachment_column),
                registry,
                &mut appended_attachments,
            )?;
        }
    }
    let appended_attachments = merge_pdf_attachments(appended_attachments, &config.temp_dir)?;

    Ok(EmailPayload {
        from,
        to,
        cc,
        bcc,
        subject,
        body,
        inline_attachments,
        appended_attachments,
    })
}

/// Assembles the outgoing SMS payloads for one row: the message with link tokens substituted by
/// bare view URLs plus the footer, fanned out to each distinct recipient number.
pub fn assemble_sms_row(
    alert: &Alert,
    config: &Configuration,
    group: &RowGroup,
    registry: &ReferenceRegistry,
) -> Result<Vec<SmsPayload>, AlertError> {
    let row = group.lead();
    let column = |key: FieldKey| alert.fields.column(key);

    let from = column(FieldKey::SmsFrom)
        .map(|column| row.value(column))
        .filter(|value| !value.is_empty())
        .unwrap_or(&config.sms_from_number)
        .to_string();

    let mut message = column(FieldKey::SmsMessage)
        .map(|column| row.value(column))
        .unwrap_or_default()
        .to_string();

    // SMS is plain text, every link token becomes the bare URL
    for token in distinct_tokens(&message, ScanShape::SmsMessage) {
        let reference = registry
            .get(&token)
            .ok_or_else(|| AlertError::MissingArtifact(token.clone()))?;
        message = message.replace(&token, &alert.view_url(config, Some(&reference.locator)));
    }
    message.push_str(&alert.sms_footer());

    let to_field = column(FieldKey::SmsTo)
        .map(|column| row.value(column))
        .unwrap_or_default();
    let numbers =
        to_e164_list(to_field, &config.phone_country_code).map_err(AlertError::Recipient)?;

    Ok(numbers
        .into_iter()
        .map(|to| SmsPayload {
            from: from.clone(),
            to,
            body: message.clone(),
        })
        .collect())
}

/// Distinct reference tokens in a text, in encounter order.
fn distinct_tokens(text: &str, shape: ScanShape) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in shape.regex().find_iter(text) {
        let raw = token.as_str();
        if !tokens.iter().any(|seen| seen == raw) {
            tokens.push(raw.to_string());
        }
    }
    tokens
}

/// Replaces every inline reference token in an email body with its HTML rendering and returns the
/// inline attachment list the substitutions referenced.
///
/// Image tokens become `cid:` image tags (wrapped in a view link when `vizlink` was given), link
/// tokens become anchors. A token whose registry entry is missing or unresolved is a hard error.
fn substitute_inline(
    alert: &Alert,
    config: &Configuration,
    mut body: String,
    registry: &ReferenceRegistry,
) -> Result<(String, Vec<Attachment>), AlertError> {
    let mut inline: Vec<Attachment> = Vec::new();

    for token in distinct_tokens(&body, ScanShape::Inline) {
        let reference = registry
            .get(&token)
            .ok_or_else(|| AlertError::MissingArtifact(token.clone()))?;

        let replacement = match reference.kind {
            ReferenceKind::Link => link_html(alert, config, reference),
            _ => {
                let attachment = reference_attachment(reference)?;
                let image_tag = format!("<img src=\"cid:{}\">", attachment.delivery_name());
                if !inline.iter().any(|seen| seen.reference == attachment.reference) {
                    inline.push(attachment);
                }
                if reference.viz_link {
                    format!(
                        "<a href=\"{}\">{}</a>",
                        alert.view_url(config, Some(&reference.locator)),
                        image_tag
                    )
                } else {
                    image_tag
                }
            }
        };

        debug!("Replacing {} in email body", token);
        body = body.replace(&token, &replacement);
    }

    Ok((body, inline))
}

fn link_html(alert: &Alert, config: &Configuration, reference: &ContentReference) -> String {
    let url = alert.view_url(config, Some(&reference.locator));
    if reference.raw_link {
        return url;
    }
    let text = reference.filename.as_deref().unwrap_or(&reference.locator);
    format!("<a href=\"{}\">{}</a>", url, text)
}

/// Builds the attachment for a resolved reference.
fn reference_attachment(reference: &ContentReference) -> Result<Attachment, AlertError> {
    let artifact = reference
        .artifact
        .as_ref()
        .ok_or_else(|| AlertError::MissingArtifact(reference.raw.clone()))?;
    // Unwrap is safe, only renderable kinds reach this point
    let format = reference.kind.format().unwrap();

    Ok(Attachment {
        reference: Some(reference.raw.clone()),
        filename: reference.filename.clone(),
        path: artifact.clone(),
        format,
        merge_pdf: reference.merge_pdf,
    })
}

/// Collects the appended attachments named by one attachment column value, deduplicating on the
/// reference string across the whole email.
fn collect_attachments(
    text: &str,
    registry: &ReferenceRegistry,
    attachments: &mut Vec<Attachment>,
) -> Result<(), AlertError> {
    for token in distinct_tokens(text, ScanShape::Attachment) {
        if attachments
            .iter()
            .any(|seen| seen.reference.as_deref() == Some(token.as_str()))
        {
            continue;
        }
        let reference = registry
            .get(&token)
            .ok_or_else(|| AlertError::MissingArtifact(token.clone()))?;
        attachments.push(reference_attachment(reference)?);
    }
    Ok(())
}

/// Merges PDF attachments sharing a custom filename into single documents.
///
/// Attachments not flagged for merging pass through untouched. A merge group of one also passes
/// through, keeping its filename. A merged document replaces its group at the position of the
/// group's first member.
pub fn merge_pdf_attachments(
    attachments: Vec<Attachment>,
    temp_dir: &Path,
) -> Result<Vec<Attachment>, AlertError> {
    enum Slot {
        Single(Attachment),
        Group(String),
    }

    let mut slots: Vec<Slot> = Vec::new();
    let mut groups: BTreeMap<String, Vec<Attachment>> = BTreeMap::new();

    for attachment in attachments {
        match (&attachment.filename, attachment.merge_pdf) {
            (Some(filename), true) if attachment.format == RenderFormat::Pdf => {
                let filename = filename.clone();
                if !groups.contains_key(&filename) {
                    slots.push(Slot::Group(filename.clone()));
                }
                groups.entry(filename).or_default().push(attachment);
            }
            _ => slots.push(Slot::Single(attachment)),
        }
    }

    let mut result = Vec::new();
    for slot in slots {
        match slot {
            Slot::Single(attachment) => result.push(attachment),
            Slot::Group(filename) => {
                // Unwrap is safe, a group slot is only pushed together with its entry
                let mut members = groups.remove(&filename).unwrap();
                if members.len() == 1 {
                    result.push(members.remove(0));
                    continue;
                }

                info!(
                    "Merging {} PDF attachments into {}",
                    members.len(),
                    filename
                );
                let stamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_millis())
                    .unwrap_or_default();
                let destination = temp_dir.join(format!("{}_{}", stamp, filename));
                let inputs: Vec<&Path> =
                    members.iter().map(|member| member.path.as_path()).collect();
                merge_pdf_files(&inputs, &destination).map_err(|message| {
                    AlertError::PdfMerge {
                        filename: filename.clone(),
                        message,
                    }
                })?;

                result.push(Attachment {
                    reference: None,
                    filename: Some(filename),
                    path: destination,
                    format: RenderFormat::Pdf,
                    merge_pdf: false,
                });
            }
        }
    }

    Ok(result)
}

/// Concatenates the pages of several PDF documents into one.
fn merge_pdf_files(inputs: &[&Path], destination: &Path) -> Result<(), String> {
    let mut max_id = 1;
    // Pages in encounter order: renumbered object ids do not follow page order within a document
    let mut pages: Vec<(ObjectId, Object)> = Vec::new();
    let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();

    for path in inputs {
        let mut document = Document::load(path).map_err(|error| error.to_string())?;
        document.renumber_objects_with(max_id);
        max_id = document.max_id + 1;

        for (_, object_id) in document.get_pages() {
            let object = document
                .get_object(object_id)
                .map_err(|error| error.to_string())?;
            pages.push((object_id, object.to_owned()));
        }
        objects.extend(document.objects);
    }

    let mut merged = Document::with_version("1.5");
    let mut catalog: Option<(ObjectId, Dictionary)> = None;
    let mut page_tree: Option<(ObjectId, Dictionary)> = None;

    for (object_id, object) in objects {
        let type_name = object
            .as_dict()
            .ok()
            .and_then(|dictionary| dictionary.get(b"Type").ok())
            .and_then(|name| name.as_name_str().ok())
            .unwrap_or("");

        match type_name {
            "Catalog" => {
                let dictionary = object.as_dict().map_err(|error| error.to_string())?;
                catalog = Some((
                    catalog.map(|(id, _)| id).unwrap_or(object_id),
                    dictionary.clone(),
                ));
            }
            "Pages" => {
                let dictionary = object.as_dict().map_err(|error| error.to_string())?;
                let mut dictionary = dictionary.clone();
                if let Some((_, previous)) = &page_tree {
                    dictionary.extend(previous);
                }
                page_tree = Some((
                    page_tree.map(|(id, _)| id).unwrap_or(object_id),
                    dictionary,
                ));
            }
            // Page objects are re-parented below; outlines are dropped
            "Page" | "Outlines" | "Outline" => {}
            _ => {
                merged.objects.insert(object_id, object);
            }
        }
    }

    let (pages_id, pages_dictionary) = page_tree.ok_or("no page tree found")?;
    let (catalog_id, mut catalog_dictionary) = catalog.ok_or("no catalog found")?;

    for (object_id, object) in &pages {
        let dictionary = object.as_dict().map_err(|error| error.to_string())?;
        let mut dictionary = dictionary.clone();
        dictionary.set("Parent", pages_id);
        merged
            .objects
            .insert(*object_id, Object::Dictionary(dictionary));
    }

    let mut pages_dictionary = pages_dictionary;
    pages_dictionary.set("Count", pages.len() as u32);
    pages_dictionary.set(
        "Kids",
        pages
            .iter()
            .map(|(object_id, _)| Object::Reference(*object_id))
            .collect::<Vec<_>>(),
    );
    merged
        .objects
        .insert(pages_id, Object::Dictionary(pages_dictionary));

    catalog_dictionary.set("Pages", pages_id);
    catalog_dictionary.remove(b"Outlines");
    merged
        .objects
        .insert(catalog_id, Object::Dictionary(catalog_dictionary));

    merged.trailer.set("Root", catalog_id);
    merged.max_id = merged.objects.len() as u32;
    merged.renumber_objects();
    merged.compress();
    merged.save(destination).map_err(|error| error.to_string())?;

    Ok(())
}
