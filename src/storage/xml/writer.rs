//! Encoding of node records as `<hopobject>` XML

use crate::core::types::format_date;
use crate::core::Result;
use crate::node::Value;
use crate::storage::xml::record::{NodeLink, NodeRecord, RecordValue};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

/// Namespace of the `hop:` elements
pub const HOP_NAMESPACE: &str = "http://www.helma.org/docs/guide/features/database";

const HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<?xml-stylesheet type=\"text/xsl\" href=\"helma.xsl\"?>\n";

/// Property names that can't be used as element names are written as
/// `<property propertyname="...">`
fn is_element_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    first_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.eq_ignore_ascii_case("property")
        && !name.to_ascii_lowercase().starts_with("xml")
}

fn link_element<'a>(tag: &'a str, link: &'a NodeLink) -> BytesStart<'a> {
    let mut elem = BytesStart::new(tag);
    elem.push_attribute(("idref", link.id.as_str()));
    if let Some(proto) = &link.prototype {
        elem.push_attribute(("prototyperef", proto.as_str()));
    }
    elem
}

/// Render a record as a complete XML document
pub fn write_node(record: &NodeRecord) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(HEADER.as_bytes().to_vec(), b' ', 2);

    let created = format_date(&record.created);
    let modified = format_date(&record.last_modified);
    let mut root = BytesStart::new("hopobject");
    root.push_attribute(("xmlns:hop", HOP_NAMESPACE));
    root.push_attribute(("id", record.id.as_str()));
    if let Some(name) = &record.name {
        root.push_attribute(("name", name.as_str()));
    }
    if let Some(proto) = &record.prototype {
        root.push_attribute(("prototype", proto.as_str()));
    }
    root.push_attribute(("created", created.as_str()));
    root.push_attribute(("lastModified", modified.as_str()));
    writer.write_event(Event::Start(root))?;

    if let Some(parent) = &record.parent {
        writer.write_event(Event::Empty(link_element("hop:parent", parent)))?;
    }

    for (name, value) in &record.properties {
        let plain = is_element_name(name);
        let tag = if plain { name.as_str() } else { "property" };
        let mut elem = BytesStart::new(tag);
        if !plain {
            elem.push_attribute(("propertyname", name.as_str()));
        }
        match value {
            RecordValue::Reference(link) => {
                elem.push_attribute(("idref", link.id.as_str()));
                if let Some(proto) = &link.prototype {
                    elem.push_attribute(("prototyperef", proto.as_str()));
                }
                writer.write_event(Event::Empty(elem))?;
            }
            RecordValue::Scalar(value) => {
                let text = match value {
                    Value::Node(handle) => handle.id(),
                    other => other.to_string(),
                };
                elem.push_attribute(("type", value.value_type().as_str()));
                if text.is_empty() {
                    writer.write_event(Event::Empty(elem))?;
                } else {
                    writer.write_event(Event::Start(elem))?;
                    writer.write_event(Event::Text(BytesText::new(&text)))?;
                    writer.write_event(Event::End(BytesEnd::new(tag)))?;
                }
            }
        }
    }

    for child in &record.children {
        writer.write_event(Event::Empty(link_element("hop:child", child)))?;
    }

    writer.write_event(Event::End(BytesEnd::new("hopobject")))?;
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_shape() {
        let mut record = NodeRecord::new("42", Some("article"));
        record
            .properties
            .push(("title".into(), RecordValue::Scalar(Value::String("A & B".into()))));
        record
            .properties
            .push(("author".into(), RecordValue::Reference(NodeLink::new("7", Some("person")))));
        record.children.push(NodeLink::new("43", Some("comment")));
        record.parent = Some(NodeLink::new("0", Some("root")));

        let text = String::from_utf8(write_node(&record).unwrap()).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("href=\"helma.xsl\""));
        assert!(text.contains("<hopobject xmlns:hop="));
        assert!(text.contains("id=\"42\""));
        assert!(text.contains("prototype=\"article\""));
        assert!(text.contains("<title type=\"string\">A &amp; B</title>"));
        assert!(text.contains("<author idref=\"7\" prototyperef=\"person\"/>"));
        assert!(text.contains("<hop:child idref=\"43\" prototyperef=\"comment\"/>"));
        assert!(text.contains("<hop:parent idref=\"0\" prototyperef=\"root\"/>"));
    }

    #[test]
    fn test_awkward_names_use_property_element() {
        assert!(is_element_name("title"));
        assert!(!is_element_name("two words"));
        assert!(!is_element_name("1st"));
        assert!(!is_element_name("property"));
        assert!(!is_element_name("xmlish"));

        let mut record = NodeRecord::new("3", None);
        record
            .properties
            .push(("two words".into(), RecordValue::Scalar(Value::Integer(2))));
        let text = String::from_utf8(write_node(&record).unwrap()).unwrap();
        assert!(text.contains("<property propertyname=\"two words\" type=\"integer\">2</property>"));
    }
}
