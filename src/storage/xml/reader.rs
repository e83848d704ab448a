//! Decoding of `<hopobject>` XML into node records

use crate::core::types::parse_date;
use crate::core::{Error, Result};
use crate::node::{Value, ValueType};
use crate::storage::xml::record::{NodeLink, NodeRecord, RecordValue};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

fn attributes(elem: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in elem.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn link(attrs: &HashMap<String, String>) -> Option<NodeLink> {
    attrs.get("idref").map(|id| NodeLink {
        id: id.clone(),
        prototype: attrs.get("prototyperef").cloned(),
    })
}

/// Property element being read
struct OpenProperty {
    name: String,
    ty: ValueType,
    text: String,
}

impl OpenProperty {
    fn finish(self) -> Result<(String, RecordValue)> {
        let value = Value::parse(self.ty, &self.text)?;
        Ok((self.name, RecordValue::Scalar(value)))
    }
}

fn header(attrs: &HashMap<String, String>) -> Result<NodeRecord> {
    let id = attrs
        .get("id")
        .ok_or_else(|| Error::invalid_input("hopobject element without id"))?;
    let mut record = NodeRecord::new(id.clone(), attrs.get("prototype").map(String::as_str));
    record.name = attrs.get("name").cloned();
    if let Some(created) = attrs.get("created").and_then(|s| parse_date(s)) {
        record.created = created;
    }
    match attrs.get("lastModified").and_then(|s| parse_date(s)) {
        Some(modified) => record.last_modified = modified,
        None => record.last_modified = record.created,
    }
    Ok(record)
}

/// Parse the contents of a node file
pub fn read_node(text: &str) -> Result<NodeRecord> {
    let mut reader = Reader::from_str(text);
    let mut record: Option<NodeRecord> = None;
    let mut open: Option<OpenProperty> = None;
    // element depth below <hopobject>
    let mut depth = 0usize;

    loop {
        let event = reader.read_event()?;
        let (elem, empty) = match &event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            _ => (None, false),
        };

        if let Some(elem) = elem {
            let name = elem.name();
            let name = name.as_ref();
            if record.is_none() {
                if name == b"hopobject" {
                    record = Some(header(&attributes(elem)?)?);
                    if empty {
                        break;
                    }
                }
                continue;
            }
            if !empty {
                depth += 1;
            }
            if depth > 1 || (empty && depth > 0) {
                // nested markup inside a property value is ignored
                continue;
            }
            let attrs = attributes(elem)?;
            let Some(current) = record.as_mut() else {
                continue;
            };
            match name {
                b"hop:child" => current.children.extend(link(&attrs)),
                b"hop:parent" => current.parent = link(&attrs),
                _ => {
                    let prop_name = match (name, attrs.get("propertyname")) {
                        (b"property", Some(explicit)) => explicit.clone(),
                        _ => String::from_utf8_lossy(name).into_owned(),
                    };
                    if let Some(target) = link(&attrs) {
                        current.properties.push((prop_name, RecordValue::Reference(target)));
                    } else {
                        let ty = attrs
                            .get("type")
                            .and_then(|t| ValueType::from_name(t))
                            .unwrap_or(ValueType::String);
                        let prop = OpenProperty {
                            name: prop_name,
                            ty,
                            text: String::new(),
                        };
                        if empty {
                            current.properties.push(prop.finish()?);
                        } else {
                            open = Some(prop);
                        }
                    }
                }
            }
            continue;
        }

        match event {
            Event::Text(t) => {
                if let Some(prop) = open.as_mut() {
                    if depth == 1 {
                        prop.text.push_str(&t.unescape()?);
                    }
                }
            }
            Event::CData(c) => {
                if let Some(prop) = open.as_mut() {
                    if depth == 1 {
                        prop.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
            }
            Event::End(e) => {
                if record.is_none() {
                    continue;
                }
                if depth == 0 && e.name().as_ref() == b"hopobject" {
                    break;
                }
                if depth == 1 {
                    if let (Some(prop), Some(current)) = (open.take(), record.as_mut()) {
                        current.properties.push(prop.finish()?);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    record.ok_or_else(|| Error::invalid_input("No hopobject element found"))
}
