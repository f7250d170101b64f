//! Accessibility roles for mirrored content.

use crate::content::{AttributeMap, ContentKind};

/// The accessibility role of a node.
///
/// Roles come from the first recognized token of the `role` attribute, or
/// failing that from the element's native semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum AccessibleRole {
    /// No specific role.
    #[default]
    Unknown,

    /// The document root.
    Document,

    /// A run of text.
    TextLeaf,

    /// A generic container (`div`, `span`, `section`, non-link `a`).
    Section,

    /// A paragraph.
    Paragraph,

    /// A heading.
    Heading,

    /// A push button.
    Button,

    /// A checkbox that can be checked or unchecked.
    CheckBox,

    /// A radio button (mutually exclusive selection).
    RadioButton,

    /// A container grouping radio buttons.
    RadioGroup,

    /// A single-line text input field.
    TextInput,

    /// A multi-line text editing area.
    TextArea,

    /// A label for a form control.
    Label,

    /// A hyperlink.
    Link,

    /// An image.
    Image,

    /// A combo box / dropdown.
    ComboBox,

    /// A list box.
    ListBox,

    /// A list of items.
    List,

    /// An item within a list.
    ListItem,

    /// A form.
    Form,

    /// A group box (`fieldset`, `role=group`).
    Group,

    /// A figure.
    Figure,

    /// The caption of a figure.
    Caption,

    /// A table.
    Table,

    /// A row within a table.
    TableRow,

    /// A cell within a table.
    TableCell,

    /// A column header.
    ColumnHeader,

    /// A dialog box.
    Dialog,

    /// An alert.
    Alert,

    /// A tooltip.
    Tooltip,

    /// A progress indicator.
    ProgressBar,

    /// A meter.
    Meter,

    /// A live status output.
    Status,

    /// A slider for selecting a value from a range.
    Slider,

    /// A separator line.
    Separator,

    /// A tab list container.
    TabList,

    /// A single tab.
    Tab,

    /// The content panel of a tab.
    TabPanel,

    /// A menu.
    Menu,

    /// A menu item.
    MenuItem,
}

impl AccessibleRole {
    /// Map a single ARIA role token.
    pub fn from_aria(token: &str) -> Option<Self> {
        let role = match token.to_ascii_lowercase().as_str() {
            "alert" => Self::Alert,
            "button" => Self::Button,
            "checkbox" => Self::CheckBox,
            "columnheader" => Self::ColumnHeader,
            "combobox" => Self::ComboBox,
            "dialog" => Self::Dialog,
            "figure" => Self::Figure,
            "form" => Self::Form,
            "group" => Self::Group,
            "heading" => Self::Heading,
            "img" | "image" => Self::Image,
            "link" => Self::Link,
            "list" => Self::List,
            "listbox" => Self::ListBox,
            "listitem" => Self::ListItem,
            "menu" => Self::Menu,
            "menuitem" => Self::MenuItem,
            "meter" => Self::Meter,
            "paragraph" => Self::Paragraph,
            "progressbar" => Self::ProgressBar,
            "radio" => Self::RadioButton,
            "radiogroup" => Self::RadioGroup,
            "row" => Self::TableRow,
            "cell" | "gridcell" => Self::TableCell,
            "separator" => Self::Separator,
            "slider" => Self::Slider,
            "status" => Self::Status,
            "tab" => Self::Tab,
            "tablist" => Self::TabList,
            "tabpanel" => Self::TabPanel,
            "table" | "grid" => Self::Table,
            "textbox" => Self::TextInput,
            "tooltip" => Self::Tooltip,
            "generic" | "region" | "none" | "presentation" => Self::Section,
            _ => return None,
        };
        Some(role)
    }

    /// Derive the role of a content node from its kind and attributes.
    pub fn derive(kind: &ContentKind, attributes: &AttributeMap) -> Self {
        match kind {
            ContentKind::Document => Self::Document,
            ContentKind::Text => Self::TextLeaf,
            ContentKind::ShadowRoot => Self::Unknown,
            ContentKind::Element { tag } => {
                let explicit = attributes
                    .get("role")
                    .and_then(|value| value.split_ascii_whitespace().find_map(Self::from_aria));
                explicit.unwrap_or_else(|| Self::from_tag(tag, attributes))
            }
        }
    }

    fn from_tag(tag: &str, attributes: &AttributeMap) -> Self {
        match tag {
            "a" if attributes.contains_key("href") => Self::Link,
            "button" => Self::Button,
            "input" => Self::from_input_type(attributes.get("type").map(String::as_str)),
            "select" => {
                let sized = attributes
                    .get("size")
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .is_some_and(|size| size > 1);
                if sized || attributes.contains_key("multiple") {
                    Self::ListBox
                } else {
                    Self::ComboBox
                }
            }
            "textarea" => Self::TextArea,
            "label" => Self::Label,
            "img" => Self::Image,
            "form" => Self::Form,
            "fieldset" => Self::Group,
            "figure" => Self::Figure,
            "figcaption" => Self::Caption,
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => Self::Heading,
            "ul" | "ol" => Self::List,
            "li" => Self::ListItem,
            "p" => Self::Paragraph,
            "dialog" => Self::Dialog,
            "progress" => Self::ProgressBar,
            "meter" => Self::Meter,
            "output" => Self::Status,
            "hr" => Self::Separator,
            "table" => Self::Table,
            "tr" => Self::TableRow,
            "td" => Self::TableCell,
            "th" => Self::ColumnHeader,
            _ => Self::Section,
        }
    }

    fn from_input_type(input_type: Option<&str>) -> Self {
        match input_type.map(str::to_ascii_lowercase).as_deref() {
            Some("radio") => Self::RadioButton,
            Some("checkbox") => Self::CheckBox,
            Some("button" | "submit" | "reset" | "image") => Self::Button,
            Some("range") => Self::Slider,
            Some("hidden") => Self::Unknown,
            _ => Self::TextInput,
        }
    }

    /// A short lowercase name, used by debug output.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Document => "document",
            Self::TextLeaf => "text",
            Self::Section => "section",
            Self::Paragraph => "paragraph",
            Self::Heading => "heading",
            Self::Button => "button",
            Self::CheckBox => "checkbox",
            Self::RadioButton => "radio",
            Self::RadioGroup => "radiogroup",
            Self::TextInput => "textbox",
            Self::TextArea => "textarea",
            Self::Label => "label",
            Self::Link => "link",
            Self::Image => "image",
            Self::ComboBox => "combobox",
            Self::ListBox => "listbox",
            Self::List => "list",
            Self::ListItem => "listitem",
            Self::Form => "form",
            Self::Group => "group",
            Self::Figure => "figure",
            Self::Caption => "caption",
            Self::Table => "table",
            Self::TableRow => "row",
            Self::TableCell => "cell",
            Self::ColumnHeader => "columnheader",
            Self::Dialog => "dialog",
            Self::Alert => "alert",
            Self::Tooltip => "tooltip",
            Self::ProgressBar => "progressbar",
            Self::Meter => "meter",
            Self::Status => "status",
            Self::Slider => "slider",
            Self::Separator => "separator",
            Self::TabList => "tablist",
            Self::Tab => "tab",
            Self::TabPanel => "tabpanel",
            Self::Menu => "menu",
            Self::MenuItem => "menuitem",
        }
    }
}
