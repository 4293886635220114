use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;
use std::collections::HashMap;

/// Rebuilds a feed-shaped XML document from stored filing and file rows, so
/// arbitrary stored subsets can be re-ingested by the same parser.
pub fn build_feed_document(filings: &[Value], files: &[Value]) -> Result<String> {
    let mut files_by_filing: HashMap<i64, Vec<&Value>> = HashMap::new();
    for file in files {
        if let Some(filing_id) = file.get("filingId").and_then(Value::as_i64) {
            files_by_filing.entry(filing_id).or_default().push(file);
        }
    }
    for group in files_by_filing.values_mut() {
        group.sort_by_key(|f| f.get("sequence").and_then(Value::as_i64).unwrap_or(0));
    }

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    rss.push_attribute(("xmlns:edgar", "https://www.sec.gov/Archives/edgar"));
    writer.write_event(Event::Start(rss))?;
    writer.write_event(Event::Start(BytesStart::new("channel")))?;
    write_text(&mut writer, "title", "Reconstructed filings")?;
    write_text(&mut writer, "description", "Filings rebuilt from stored records")?;
    write_text(&mut writer, "language", "en-us")?;
    write_text(&mut writer, "lastBuildDate", &Utc::now().to_rfc2822())?;

    for filing in filings {
        write_item(&mut writer, filing, &files_by_filing)?;
    }

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    writer.write_event(Event::End(BytesEnd::new("rss")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn str_field<'a>(row: &'a Value, name: &str) -> Option<&'a str> {
    row.get(name).and_then(Value::as_str)
}

fn write_text<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_opt<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    value: Option<&str>,
) -> Result<()> {
    if let Some(text) = value {
        write_text(writer, name, text)?;
    }
    Ok(())
}

/// RSS pubDate shape, from the RFC 3339 form the store keeps.
fn format_pub_date(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.to_rfc2822())
}

fn format_filing_date(raw: &str) -> Option<String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%m/%d/%Y").to_string())
}

fn format_period(raw: &str) -> Option<String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y%m%d").to_string())
}

fn write_item<W: std::io::Write>(
    writer: &mut Writer<W>,
    filing: &Value,
    files_by_filing: &HashMap<i64, Vec<&Value>>,
) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("item")))?;
    let title = match (str_field(filing, "companyName"), str_field(filing, "formType")) {
        (Some(name), Some(form)) => format!("{} ({})", name, form),
        (Some(name), None) => name.to_string(),
        (None, Some(form)) => form.to_string(),
        (None, None) => String::new(),
    };
    write_text(writer, "title", &title)?;
    write_opt(writer, "link", str_field(filing, "filingLink"))?;
    write_opt(writer, "guid", str_field(filing, "filingLink"))?;
    if let Some(url) = str_field(filing, "enclosureUrl") {
        let mut enclosure = BytesStart::new("enclosure");
        enclosure.push_attribute(("url", url));
        if let Some(size) = filing.get("enclosureSize").and_then(Value::as_i64) {
            enclosure.push_attribute(("length", size.to_string().as_str()));
        }
        enclosure.push_attribute(("type", "application/zip"));
        writer.write_event(Event::Empty(enclosure))?;
    }
    write_opt(writer, "description", str_field(filing, "formType"))?;
    write_opt(
        writer,
        "pubDate",
        str_field(filing, "pubDate")
            .and_then(format_pub_date)
            .as_deref(),
    )?;

    writer.write_event(Event::Start(BytesStart::new("edgar:xbrlFiling")))?;
    write_opt(writer, "edgar:companyName", str_field(filing, "companyName"))?;
    write_opt(writer, "edgar:formType", str_field(filing, "formType"))?;
    write_opt(
        writer,
        "edgar:filingDate",
        str_field(filing, "filingDate")
            .and_then(format_filing_date)
            .as_deref(),
    )?;
    write_opt(writer, "edgar:cikNumber", str_field(filing, "cikNumber"))?;
    write_opt(
        writer,
        "edgar:accessionNumber",
        str_field(filing, "accessionNumber"),
    )?;
    write_opt(writer, "edgar:fileNumber", str_field(filing, "fileNumber"))?;
    write_opt(
        writer,
        "edgar:acceptanceDatetime",
        str_field(filing, "acceptanceDatetime"),
    )?;
    write_opt(
        writer,
        "edgar:period",
        str_field(filing, "period").and_then(format_period).as_deref(),
    )?;
    if let Some(sic) = filing.get("assignedSic").and_then(Value::as_i64) {
        write_text(writer, "edgar:assignedSic", &sic.to_string())?;
    }
    write_opt(
        writer,
        "edgar:assistantDirector",
        str_field(filing, "assistantDirector"),
    )?;
    write_opt(
        writer,
        "edgar:fiscalYearEnd",
        str_field(filing, "fiscalYearEnd"),
    )?;

    let filing_id = filing.get("filingId").and_then(Value::as_i64).unwrap_or(0);
    if let Some(group) = files_by_filing.get(&filing_id) {
        writer.write_event(Event::Start(BytesStart::new("edgar:xbrlFiles")))?;
        for file in group {
            let mut el = BytesStart::new("edgar:xbrlFile");
            if let Some(sequence) = file.get("sequence").and_then(Value::as_i64) {
                el.push_attribute(("edgar:sequence", sequence.to_string().as_str()));
            }
            for (attr, field) in [
                ("edgar:file", "file"),
                ("edgar:type", "type"),
                ("edgar:description", "description"),
                ("edgar:url", "url"),
            ] {
                if let Some(value) = str_field(file, field) {
                    el.push_attribute((attr, value));
                }
            }
            if let Some(size) = file.get("size").and_then(Value::as_i64) {
                el.push_attribute(("edgar:size", size.to_string().as_str()));
            }
            if file.get("inlineXBRL").and_then(Value::as_i64) == Some(1) {
                el.push_attribute(("edgar:inlineXBRL", "true"));
            }
            writer.write_event(Event::Empty(el))?;
        }
        writer.write_event(Event::End(BytesEnd::new("edgar:xbrlFiles")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("edgar:xbrlFiling")))?;
    writer.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}
