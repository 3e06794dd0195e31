// Recursive-descent parser.
//
// Class bodies are parsed twice: pass one reads only field declarations so
// the layout and every member name are fixed, then the scanner rewinds to
// the opening brace and pass two parses function bodies with forward
// references available. Parse errors are recorded and the parser skips to
// the next ';' or balanced '}' so one run can report several diagnostics.

use crate::ast::{BinOp, CallInfo, Expr, ExprId, UpdateOp};
use crate::class::{Access, FnFlag, Function, FunctionParam};
use crate::memory::Region;
use crate::modules;
use crate::program::Program;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::scope::ScopeChain;
use crate::template::{
    CommandArg, TemplateArg, TemplateCommand, TemplateDefinition, TemplateInstantiation,
    TemplateParam, TemplateParamKind,
};
use crate::types::*;
use crate::value::Value;
use enumflags2::BitFlags;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Clone, Debug)]
pub struct CompileError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({}): {}", self.line, self.column, self.message)
    }
}

pub struct Parser<'a> {
    program: &'a mut Program,
    errors: Vec<CompileError>,
    parsed_files: Vec<PathBuf>,
    current_class: TypeId,
    current_class_name: String,
    current_fn_returns_ref: bool,
    scope: ScopeChain,
}

impl<'a> Parser<'a> {
    pub fn new(program: &'a mut Program) -> Parser<'a> {
        Parser {
            program,
            errors: Vec::new(),
            parsed_files: Vec::new(),
            current_class: INVALID_ID,
            current_class_name: String::new(),
            current_fn_returns_ref: false,
            scope: ScopeChain::new(),
        }
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<CompileError> {
        self.errors
    }

    fn error(&mut self, tok: &Token, message: impl Into<String>) {
        self.errors.push(CompileError {
            line: tok.line,
            column: tok.column,
            message: message.into(),
        });
    }

    fn fail<T>(&mut self, tok: &Token, message: impl Into<String>) -> Option<T> {
        self.error(tok, message);
        None
    }

    pub fn parse_file(&mut self, path: &Path) {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if self.parsed_files.contains(&canonical) {
            return;
        }
        self.parsed_files.push(canonical);

        let source = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                self.errors.push(CompileError {
                    line: 0,
                    column: 0,
                    message: format!("couldn't read {}: {}", path.display(), e),
                });
                return;
            }
        };
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        self.parse_source(&source, &dir);
    }

    pub fn parse_source(&mut self, source: &str, dir: &Path) {
        let mut s = Scanner::new(source);
        loop {
            let tok = s.next();
            match tok.kind {
                TokenKind::End => break,
                TokenKind::Import => self.parse_import(&mut s, dir),
                TokenKind::Class => {
                    if self.parse_class(&mut s).is_none() {
                        skip_statement(&mut s);
                    }
                }
                _ => {
                    self.error(&tok, format!("expected Import or class, found '{}'", tok.text));
                    skip_statement(&mut s);
                }
            }
        }
    }

    fn parse_import(&mut self, s: &mut Scanner, dir: &Path) {
        let tok = s.next();
        match tok.kind {
            TokenKind::Identifier => match modules::lookup(&tok.text) {
                Some(id) => self.program.add_module(&tok.text, id),
                None => self.error(&tok, format!("unknown built-in module '{}'", tok.text)),
            },
            TokenKind::StringLiteral => {
                let path = dir.join(&tok.text);
                self.parse_file(&path);
            }
            _ => self.error(&tok, "expected module name or file path after Import"),
        }
        if s.peek().kind == TokenKind::Semicolon {
            s.next();
        }
    }

    // ---- classes ---------------------------------------------------------

    fn parse_class(&mut self, s: &mut Scanner) -> Option<()> {
        let name_tok = match s.expect(TokenKind::Identifier) {
            Ok(tok) => tok,
            Err(tok) => return self.fail(&tok, "expected identifier after class"),
        };
        let class_name = name_tok.text.clone();
        if self.program.class_id(&class_name) != INVALID_ID {
            return self.fail(&name_tok, format!("class '{}' is already defined", class_name));
        }

        let mut template = TemplateDefinition::default();
        let mut base = None;
        while s.peek().kind == TokenKind::Arrow {
            s.next();
            let extension = s.next();
            match extension.kind {
                TokenKind::Template => {
                    if let Err(tok) = s.expect(TokenKind::OpenBracket) {
                        return self.fail(&tok, "expected '[' after template");
                    }
                    loop {
                        let kind_tok = s.next();
                        let kind = match kind_tok.kind {
                            TokenKind::Class => TemplateParamKind::Type,
                            TokenKind::UInt32 => TemplateParamKind::Int,
                            _ => {
                                return self.fail(&kind_tok, "expected 'class' or 'uint32' template parameter")
                            }
                        };
                        let param_tok = match s.expect(TokenKind::Identifier) {
                            Ok(tok) => tok,
                            Err(tok) => return self.fail(&tok, "expected template parameter name"),
                        };
                        template.params.push(TemplateParam { kind, name: param_tok.text });
                        let sep = s.next();
                        match sep.kind {
                            TokenKind::CloseBracket => break,
                            TokenKind::Comma => continue,
                            _ => return self.fail(&sep, "expected ',' or ']' in template parameters"),
                        }
                    }
                }
                TokenKind::Inherit => {
                    if let Err(tok) = s.expect(TokenKind::OpenBracket) {
                        return self.fail(&tok, "expected '[' after inherit");
                    }
                    let base_tok = match s.expect(TokenKind::Identifier) {
                        Ok(tok) => tok,
                        Err(tok) => return self.fail(&tok, "expected base class name"),
                    };
                    let base_id = self.program.class_id(&base_tok.text);
                    if base_id == INVALID_ID {
                        return self.fail(&base_tok, format!("unknown base class '{}'", base_tok.text));
                    }
                    base = Some(base_id);
                    if let Err(tok) = s.expect(TokenKind::CloseBracket) {
                        return self.fail(&tok, "expected ']' after base class");
                    }
                }
                _ => return self.fail(&extension, "expected template or inherit after '->'"),
            }
        }

        let open_brace = match s.expect(TokenKind::OpenBrace) {
            Ok(tok) => tok,
            Err(tok) => return self.fail(&tok, "expected '{' after class name"),
        };

        let class_id = self.program.add_class(class_name.clone(), base);
        self.program.class_mut(class_id).template = template;
        self.current_class = class_id;
        self.current_class_name = class_name;

        // pass 1: fields only, fixing the layout
        let mut member_offset = base.map_or(0, |b| self.program.class(b).size);
        let mut static_offset = 0;
        loop {
            let tok = s.peek();
            if tok.kind == TokenKind::CloseBrace || tok.kind == TokenKind::End {
                break;
            }
            if self
                .parse_class_variable(s, class_id, &mut member_offset, &mut static_offset, true)
                .is_none()
            {
                skip_statement(s);
            }
        }
        s.set_peek(&open_brace);
        self.program.class_mut(class_id).size = member_offset;
        self.program.class_mut(class_id).static_size = static_offset;

        // pass 2: functions; field declarations are consumed again without
        // being recorded
        s.next(); // the '{' again
        loop {
            let tok = s.peek();
            match tok.kind {
                TokenKind::CloseBrace => {
                    s.next();
                    break;
                }
                TokenKind::End => return self.fail(&tok, "unexpected end of file in class body"),
                _ => {
                    let mark = self.errors.len();
                    let (mut skip_a, mut skip_b) = (0, 0);
                    if self
                        .parse_class_variable(s, class_id, &mut skip_a, &mut skip_b, false)
                        .is_some()
                    {
                        continue;
                    }
                    self.errors.truncate(mark);
                    s.set_peek(&tok);
                    if self.parse_function(s, class_id).is_none() {
                        skip_statement(s);
                    }
                }
            }
        }
        Some(())
    }

    /// Try to parse one field declaration; `None` (without diagnostics for
    /// plain mismatch) means the tokens belong to a function and the caller
    /// skips them in this pass.
    fn parse_class_variable(
        &mut self,
        s: &mut Scanner,
        class_id: TypeId,
        member_offset: &mut u64,
        static_offset: &mut u64,
        record: bool,
    ) -> Option<()> {
        let mut tok = s.next();
        if tok.kind == TokenKind::Public || tok.kind == TokenKind::Private {
            tok = s.next();
        }
        let mut is_static = false;
        if tok.kind == TokenKind::Static {
            is_static = true;
            tok = s.next();
        }
        if tok.kind == TokenKind::Virtual || tok.kind == TokenKind::Tilde {
            return None;
        }

        let mut template_type_name = String::new();
        let mut type_id = self.parse_type(&tok);
        if type_id == INVALID_ID {
            if tok.kind == TokenKind::Identifier
                && self.program.class(class_id).template.is_type_param(&tok.text)
            {
                template_type_name = tok.text.clone();
                type_id = TYPE_PLACEHOLDER;
            } else {
                return None;
            }
        }

        let mut command = None;
        if s.peek().kind == TokenKind::Less && is_class_type(type_id) {
            s.next();
            let (inst, cmd, has_placeholder) = self.parse_template_args(s, type_id)?;
            if has_placeholder {
                command = Some(cmd);
                type_id = TYPE_PLACEHOLDER;
            } else {
                type_id = match self.program.instantiate_template(type_id, &inst) {
                    Ok(id) => id,
                    Err(message) => return self.fail(&tok, message),
                };
            }
        }

        let mut pointer_level = parse_pointer_level(s);

        let name_tok = s.next();
        if name_tok.kind != TokenKind::Identifier {
            return None;
        }
        if s.peek().kind == TokenKind::OpenParen {
            // a function after all
            return None;
        }

        let mut dims = Vec::new();
        if s.peek().kind == TokenKind::OpenBracket {
            dims = self.parse_array_dimensions(s, class_id)?;
            pointer_level += 1;
        }

        let mut init_expr = None;
        if s.peek().kind == TokenKind::Equals {
            s.next();
            let expr = self.parse_expression(s)?;
            if is_static {
                init_expr = Some(expr);
            }
        }
        if let Err(tok) = s.expect(TokenKind::Semicolon) {
            return self.fail(&tok, "expected ';' after field declaration");
        }

        if !record {
            return Some(());
        }
        let (shift, total) = self.program.field_layout(type_id, pointer_level, &dims);
        let field = crate::class::ClassField {
            name: name_tok.text,
            type_info: TypeInfo::new(type_id, pointer_level),
            offset: if is_static { *static_offset + shift } else { *member_offset + shift },
            size: total,
            dims,
            template_type_name,
            command,
            init_expr,
        };
        if is_static {
            *static_offset += total;
            self.program.class_mut(class_id).static_fields.push(field);
        } else {
            *member_offset += total;
            self.program.class_mut(class_id).member_fields.push(field);
        }
        Some(())
    }

    fn parse_function(&mut self, s: &mut Scanner, class_id: TypeId) -> Option<()> {
        let mut access = Access::Public;
        let mut flags: BitFlags<FnFlag> = BitFlags::empty();
        let mut tok = s.next();

        if tok.kind == TokenKind::Public {
            tok = s.next();
        } else if tok.kind == TokenKind::Private {
            access = Access::Private;
            tok = s.next();
        }

        let mut is_destructor = false;
        if tok.kind == TokenKind::Tilde {
            is_destructor = true;
            tok = s.next();
        }
        if tok.kind == TokenKind::Static {
            flags |= FnFlag::Static;
            tok = s.next();
        } else if tok.kind == TokenKind::Virtual {
            flags |= FnFlag::Virtual;
            tok = s.next();
        }

        let mut return_info = TypeInfo::new(TYPE_VOID, 0);
        let mut return_template = String::new();
        let mut returns_reference = false;
        let name;

        let is_constructor = !is_destructor
            && !flags.contains(FnFlag::Static)
            && tok.kind == TokenKind::Identifier
            && tok.text == self.current_class_name
            && s.peek().kind == TokenKind::OpenParen;

        if is_constructor {
            name = self.current_class_name.clone();
        } else if is_destructor {
            if tok.kind != TokenKind::Identifier || tok.text != self.current_class_name {
                return self.fail(&tok, "destructor name must match the class");
            }
            name = format!("~{}", self.current_class_name);
        } else {
            let mut rtype = self.parse_type(&tok);
            if rtype == INVALID_ID {
                if tok.kind == TokenKind::Identifier
                    && self.program.class(class_id).template.is_type_param(&tok.text)
                {
                    return_template = tok.text.clone();
                    rtype = TYPE_PLACEHOLDER;
                } else {
                    return self.fail(&tok, format!("unknown return type '{}'", tok.text));
                }
            }
            let plevel = parse_pointer_level(s);
            return_info = TypeInfo::new(rtype, plevel);
            if s.peek().kind == TokenKind::Amp {
                s.next();
                returns_reference = true;
            }

            let name_tok = s.next();
            name = match name_tok.kind {
                TokenKind::Operator => {
                    let op_tok = s.next();
                    match op_tok.kind {
                        TokenKind::Equals => String::from("operator="),
                        TokenKind::Plus => String::from("operator+"),
                        TokenKind::Minus => String::from("operator-"),
                        TokenKind::Asterisk => String::from("operator*"),
                        TokenKind::Slash => String::from("operator/"),
                        TokenKind::Percent => String::from("operator%"),
                        TokenKind::EqualsEquals => String::from("operator=="),
                        TokenKind::NotEquals => String::from("operator!="),
                        TokenKind::Less => String::from("operator<"),
                        TokenKind::Greater => String::from("operator>"),
                        TokenKind::LessEquals => String::from("operator<="),
                        TokenKind::GreaterEquals => String::from("operator>="),
                        TokenKind::OpenBracket => {
                            if let Err(tok) = s.expect(TokenKind::CloseBracket) {
                                return self.fail(&tok, "expected ']' in operator[]");
                            }
                            String::from("operator[]")
                        }
                        _ => return self.fail(&op_tok, "unsupported operator"),
                    }
                }
                TokenKind::Identifier => name_tok.text,
                _ => return self.fail(&name_tok, "expected function name"),
            };
        }
        self.current_fn_returns_ref = returns_reference;

        if name == "Main" {
            self.program.main_class = Some(class_id);
        }

        self.scope = ScopeChain::new();
        if let Err(tok) = s.expect(TokenKind::OpenParen) {
            return self.fail(&tok, "expected '(' after function name");
        }

        let mut params = Vec::new();
        loop {
            let type_tok = s.next();
            if type_tok.kind == TokenKind::CloseParen {
                break;
            }

            let mut template_type_name = String::new();
            let mut ptype = self.parse_type(&type_tok);
            if ptype == INVALID_ID {
                if type_tok.kind == TokenKind::Identifier
                    && self.program.class(class_id).template.is_type_param(&type_tok.text)
                {
                    template_type_name = type_tok.text.clone();
                    ptype = TYPE_PLACEHOLDER;
                } else {
                    return self.fail(&type_tok, format!("unknown parameter type '{}'", type_tok.text));
                }
            }
            let mut plevel = parse_pointer_level(s);

            let mut command = None;
            if s.peek().kind == TokenKind::Less && is_class_type(ptype) {
                s.next();
                let (inst, cmd, has_placeholder) = self.parse_template_args(s, ptype)?;
                if has_placeholder {
                    command = Some(cmd);
                    ptype = TYPE_PLACEHOLDER;
                } else {
                    ptype = match self.program.instantiate_template(ptype, &inst) {
                        Ok(id) => id,
                        Err(message) => return self.fail(&type_tok, message),
                    };
                }
                plevel += parse_pointer_level(s);
            }

            let mut is_reference = false;
            if s.peek().kind == TokenKind::Amp {
                s.next();
                is_reference = true;
            }

            let name_tok = match s.expect(TokenKind::Identifier) {
                Ok(tok) => tok,
                Err(tok) => return self.fail(&tok, "expected parameter name"),
            };
            let slot = self.scope.add_local(
                &name_tok.text,
                TypeInfo::new(ptype, plevel),
                &template_type_name,
                command.clone(),
            );
            params.push(FunctionParam {
                type_info: TypeInfo::new(ptype, plevel),
                is_reference,
                slot,
                template_type_name,
                command,
            });

            let sep = s.next();
            match sep.kind {
                TokenKind::Comma => continue,
                TokenKind::CloseParen => break,
                _ => return self.fail(&sep, "expected ',' or ')' in parameter list"),
            }
        }

        if let Err(tok) = s.expect(TokenKind::OpenBrace) {
            return self.fail(&tok, "expected '{' to open function body");
        }

        let mut body = Vec::new();
        loop {
            let tok = s.peek();
            if tok.kind == TokenKind::CloseBrace {
                s.next();
                break;
            }
            if tok.kind == TokenKind::End {
                return self.fail(&tok, "unexpected end of file in function body");
            }
            match self.parse_statement(s) {
                Some(stmt) => body.push(stmt),
                None => skip_statement(s),
            }
        }

        let func = Function {
            name,
            access,
            flags,
            return_info,
            return_template_type_name: return_template,
            returns_reference,
            params,
            body,
            id: 0,
            num_locals: self.scope.num_locals(),
            pc: 0,
        };
        self.program.add_class_function(class_id, func);
        Some(())
    }

    // ---- types and templates --------------------------------------------

    fn parse_type(&self, tok: &Token) -> TypeId {
        match tok.kind {
            TokenKind::Identifier => self.program.class_id(&tok.text),
            TokenKind::Void => TYPE_VOID,
            TokenKind::Bool => TYPE_BOOL,
            TokenKind::Char => TYPE_CHAR,
            TokenKind::UInt8 => TYPE_UINT8,
            TokenKind::UInt16 => TYPE_UINT16,
            TokenKind::UInt32 => TYPE_UINT32,
            TokenKind::UInt64 => TYPE_UINT64,
            TokenKind::Int8 => TYPE_INT8,
            TokenKind::Int16 => TYPE_INT16,
            TokenKind::Int32 => TYPE_INT32,
            TokenKind::Int64 => TYPE_INT64,
            TokenKind::Real32 => TYPE_REAL32,
            TokenKind::Real64 => TYPE_REAL64,
            _ => INVALID_ID,
        }
    }

    /// Arguments of `X<...>`, after the '<'. Returns the instantiation
    /// (placeholders included), the recorded command for deferred replay,
    /// and whether any argument is still a placeholder.
    fn parse_template_args(
        &mut self,
        s: &mut Scanner,
        template_class: TypeId,
    ) -> Option<(TemplateInstantiation, Rc<TemplateCommand>, bool)> {
        let mut inst = TemplateInstantiation::default();
        let mut command_args = Vec::new();
        let mut has_placeholder = false;

        loop {
            let tok = s.next();
            let arg;
            let cmd_arg;
            match tok.kind {
                TokenKind::NumberLiteral => {
                    let value: u32 = tok.text.parse().unwrap_or(0);
                    arg = TemplateArg::int(value);
                    cmd_arg = CommandArg::Arg(arg.clone());
                }
                TokenKind::Identifier => {
                    let def = &self.program.class(self.current_class).template;
                    if def.is_type_param(&tok.text) {
                        let mut placeholder =
                            TemplateArg::placeholder(TemplateParamKind::Type, &tok.text);
                        placeholder.pointer_level = parse_pointer_level(s);
                        has_placeholder = true;
                        arg = placeholder;
                        cmd_arg = CommandArg::Arg(arg.clone());
                    } else if def.is_int_param(&tok.text) {
                        has_placeholder = true;
                        arg = TemplateArg::placeholder(TemplateParamKind::Int, &tok.text);
                        cmd_arg = CommandArg::Arg(arg.clone());
                    } else {
                        let class_id = self.program.class_id(&tok.text);
                        if class_id == INVALID_ID {
                            return self.fail(&tok, format!("unknown template argument '{}'", tok.text));
                        }
                        if s.peek().kind == TokenKind::Less {
                            s.next();
                            let (nested_inst, nested_cmd, nested_placeholder) =
                                self.parse_template_args(s, class_id)?;
                            if nested_placeholder {
                                has_placeholder = true;
                                arg = TemplateArg::placeholder(TemplateParamKind::Type, "");
                                cmd_arg = CommandArg::Nested(nested_cmd);
                            } else {
                                let concrete =
                                    match self.program.instantiate_template(class_id, &nested_inst) {
                                        Ok(id) => id,
                                        Err(message) => return self.fail(&tok, message),
                                    };
                                arg = TemplateArg::concrete_type(concrete, parse_pointer_level(s));
                                cmd_arg = CommandArg::Arg(arg.clone());
                            }
                        } else {
                            arg = TemplateArg::concrete_type(class_id, parse_pointer_level(s));
                            cmd_arg = CommandArg::Arg(arg.clone());
                        }
                    }
                }
                _ if tok.is_type_keyword() => {
                    let t = self.parse_type(&tok);
                    arg = TemplateArg::concrete_type(t, parse_pointer_level(s));
                    cmd_arg = CommandArg::Arg(arg.clone());
                }
                _ => return self.fail(&tok, "expected template argument"),
            }
            inst.args.push(arg);
            command_args.push(cmd_arg);

            let sep = s.next();
            match sep.kind {
                TokenKind::Greater => break,
                TokenKind::Comma => continue,
                _ => return self.fail(&sep, "expected ',' or '>' in template arguments"),
            }
        }

        let command = Rc::new(TemplateCommand { class_id: template_class, args: command_args });
        Some((inst, command, has_placeholder))
    }

    // ---- statements ------------------------------------------------------

    fn parse_block(&mut self, s: &mut Scanner) -> Option<Vec<ExprId>> {
        let mut body = Vec::new();
        if s.peek().kind == TokenKind::OpenBrace {
            s.next();
            self.scope.push();
            loop {
                let tok = s.peek();
                if tok.kind == TokenKind::CloseBrace {
                    s.next();
                    break;
                }
                if tok.kind == TokenKind::End {
                    self.scope.pop();
                    return self.fail(&tok, "unexpected end of file in block");
                }
                match self.parse_statement(s) {
                    Some(stmt) => body.push(stmt),
                    None => skip_statement(s),
                }
            }
            self.scope.pop();
        } else {
            body.push(self.parse_statement(s)?);
        }
        Some(body)
    }

    fn parse_statement(&mut self, s: &mut Scanner) -> Option<ExprId> {
        let tok = s.next();
        match tok.kind {
            TokenKind::If => self.parse_if(s),
            TokenKind::For => self.parse_for(s),
            TokenKind::While => self.parse_while(s),
            TokenKind::Break => {
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::Break))
            }
            TokenKind::Continue => {
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::Continue))
            }
            TokenKind::Breakpoint => {
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::Breakpoint))
            }
            TokenKind::Return => {
                if s.peek().kind == TokenKind::Semicolon {
                    s.next();
                    return Some(self.program.arena.add(Expr::Return { expr: None, by_reference: false }));
                }
                let expr = self.parse_expression(s)?;
                self.expect_semicolon(s)?;
                let by_reference = self.current_fn_returns_ref;
                Some(self.program.arena.add(Expr::Return { expr: Some(expr), by_reference }))
            }
            TokenKind::Delete => {
                let mut is_array = false;
                if s.peek().kind == TokenKind::OpenBracket {
                    s.next();
                    if let Err(tok) = s.expect(TokenKind::CloseBracket) {
                        return self.fail(&tok, "expected ']' in delete[]");
                    }
                    is_array = true;
                }
                let expr = self.parse_expression(s)?;
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::Delete { expr, is_array }))
            }
            TokenKind::Throw | TokenKind::Catch => {
                self.fail(&tok, "exceptions are not supported")
            }
            _ if tok.is_type_keyword() => self.parse_primitive_declaration(s, &tok),
            TokenKind::Identifier => self.parse_identifier_statement(s, &tok),
            TokenKind::This | TokenKind::PlusPlus | TokenKind::MinusMinus => {
                s.set_peek(&tok);
                let expr = self.parse_expression(s)?;
                self.expect_semicolon(s)?;
                Some(expr)
            }
            _ => self.fail(&tok, format!("unexpected token '{}' at statement start", tok.text)),
        }
    }

    fn expect_semicolon(&mut self, s: &mut Scanner) -> Option<()> {
        match s.expect(TokenKind::Semicolon) {
            Ok(_) => Some(()),
            Err(tok) => self.fail(&tok, "expected ';'"),
        }
    }

    fn parse_if(&mut self, s: &mut Scanner) -> Option<ExprId> {
        if let Err(tok) = s.expect(TokenKind::OpenParen) {
            return self.fail(&tok, "expected '(' after if");
        }
        let cond = self.parse_expression(s)?;
        if let Err(tok) = s.expect(TokenKind::CloseParen) {
            return self.fail(&tok, "expected ')' after condition");
        }

        let then_scope = s.peek().kind == TokenKind::OpenBrace;
        let then_body = self.parse_block(s)?;

        let mut else_scope = false;
        let mut else_body = Vec::new();
        if s.peek().kind == TokenKind::Else {
            s.next();
            else_scope = s.peek().kind == TokenKind::OpenBrace;
            else_body = self.parse_block(s)?;
        }

        Some(self.program.arena.add(Expr::IfElse {
            cond,
            then_scope,
            else_scope,
            then_body,
            else_body,
        }))
    }

    fn parse_for(&mut self, s: &mut Scanner) -> Option<ExprId> {
        if let Err(tok) = s.expect(TokenKind::OpenParen) {
            return self.fail(&tok, "expected '(' after for");
        }
        self.scope.push();

        let init = if s.peek().kind == TokenKind::Semicolon {
            s.next();
            None
        } else {
            Some(self.parse_statement(s)?)
        };

        let cond = if s.peek().kind == TokenKind::Semicolon {
            None
        } else {
            Some(self.parse_expression(s)?)
        };
        if let Err(tok) = s.expect(TokenKind::Semicolon) {
            self.scope.pop();
            return self.fail(&tok, "expected ';' after loop condition");
        }

        let step = if s.peek().kind == TokenKind::CloseParen {
            None
        } else {
            let expr = self.parse_expression(s)?;
            Some(expr)
        };
        if let Err(tok) = s.expect(TokenKind::CloseParen) {
            self.scope.pop();
            return self.fail(&tok, "expected ')' after for header");
        }

        let body = self.parse_block(s)?;
        self.scope.pop();
        Some(self.program.arena.add(Expr::For { init, cond, step, body }))
    }

    fn parse_while(&mut self, s: &mut Scanner) -> Option<ExprId> {
        if let Err(tok) = s.expect(TokenKind::OpenParen) {
            return self.fail(&tok, "expected '(' after while");
        }
        let cond = self.parse_expression(s)?;
        if let Err(tok) = s.expect(TokenKind::CloseParen) {
            return self.fail(&tok, "expected ')' after condition");
        }
        let body = self.parse_block(s)?;
        Some(self.program.arena.add(Expr::While { cond, body }))
    }

    fn parse_primitive_declaration(&mut self, s: &mut Scanner, type_tok: &Token) -> Option<ExprId> {
        let type_id = self.parse_type(type_tok);
        let prim = Primitive::from_type(type_id)?;
        let pointer_level = parse_pointer_level(s);

        let mut is_reference = false;
        if s.peek().kind == TokenKind::Amp {
            s.next();
            is_reference = true;
        }

        let name_tok = match s.expect(TokenKind::Identifier) {
            Ok(tok) => tok,
            Err(tok) => return self.fail(&tok, "expected variable name"),
        };

        if s.peek().kind == TokenKind::OpenBracket {
            let dims = self.parse_array_dimensions(s, self.current_class)?;
            let slot = self.scope.add_local(
                &name_tok.text,
                TypeInfo::new(type_id, pointer_level + 1),
                "",
                None,
            );
            let mut inits = Vec::new();
            if s.peek().kind == TokenKind::Equals {
                s.next();
                inits = self.parse_array_initializers(s)?;
            }
            self.expect_semicolon(s)?;
            return Some(self.program.arena.add(Expr::DeclareArray {
                type_id,
                elem_pointer_level: pointer_level,
                slot,
                dims,
                inits,
                template_type_name: String::new(),
            }));
        }

        let slot = self.scope.add_local(
            &name_tok.text,
            TypeInfo::new(type_id, pointer_level),
            "",
            None,
        );

        let mut init = None;
        if s.peek().kind == TokenKind::Equals {
            s.next();
            init = Some(self.parse_expression(s)?);
        } else if is_reference {
            return self.fail(&name_tok, "a reference declaration requires an initializer");
        }
        self.expect_semicolon(s)?;

        if is_reference {
            return Some(self.program.arena.add(Expr::DeclareRef {
                type_id,
                pointer_level,
                slot,
                init: init.unwrap(),
                template_type_name: String::new(),
                command: None,
            }));
        }
        if pointer_level > 0 {
            return Some(self.program.arena.add(Expr::DeclarePointer {
                type_id,
                pointer_level,
                slot,
                init,
                template_type_name: String::new(),
                command: None,
            }));
        }
        Some(self.program.arena.add(Expr::DeclarePrim { prim, slot, init }))
    }

    /// A statement starting with an identifier: either a declaration of a
    /// user type (object, pointer, reference, array, templated) or an
    /// expression statement.
    fn parse_identifier_statement(&mut self, s: &mut Scanner, first: &Token) -> Option<ExprId> {
        let next = s.next();

        let as_type = {
            let class_id = self.program.class_id(&first.text);
            if class_id != INVALID_ID {
                Some((class_id, String::new()))
            } else if self
                .current_class_is_template_param(&first.text)
            {
                Some((TYPE_PLACEHOLDER, first.text.clone()))
            } else {
                None
            }
        };

        match next.kind {
            TokenKind::Identifier if as_type.is_some() => {
                let (type_id, template_type_name) = as_type.clone().unwrap();
                self.parse_object_declaration(s, type_id, template_type_name, None, &next)
            }
            TokenKind::Asterisk if as_type.is_some() => {
                let (type_id, template_type_name) = as_type.clone().unwrap();
                let pointer_level = 1 + parse_pointer_level(s);
                let name_tok = match s.peek().kind {
                    TokenKind::Amp => {
                        s.next();
                        let name_tok = match s.expect(TokenKind::Identifier) {
                            Ok(tok) => tok,
                            Err(tok) => return self.fail(&tok, "expected variable name"),
                        };
                        return self.parse_reference_declaration(
                            s,
                            type_id,
                            template_type_name,
                            None,
                            pointer_level,
                            &name_tok,
                        );
                    }
                    _ => match s.expect(TokenKind::Identifier) {
                        Ok(tok) => tok,
                        Err(tok) => return self.fail(&tok, "expected variable name"),
                    },
                };
                self.parse_pointer_declaration(s, type_id, template_type_name, None, pointer_level, &name_tok)
            }
            TokenKind::Amp if as_type.is_some() => {
                let (type_id, template_type_name) = as_type.clone().unwrap();
                let name_tok = match s.expect(TokenKind::Identifier) {
                    Ok(tok) => tok,
                    Err(tok) => return self.fail(&tok, "expected variable name"),
                };
                self.parse_reference_declaration(s, type_id, template_type_name, None, 0, &name_tok)
            }
            TokenKind::Less if as_type.as_ref().map_or(false, |(t, _)| {
                is_class_type(*t) && self.program.class(*t).is_template_class()
            }) =>
            {
                let (template_id, _) = as_type.clone().unwrap();
                let (inst, cmd, has_placeholder) = self.parse_template_args(s, template_id)?;
                let (type_id, command, template_type_name) = if has_placeholder {
                    (TYPE_PLACEHOLDER, Some(cmd), String::new())
                } else {
                    let id = match self.program.instantiate_template(template_id, &inst) {
                        Ok(id) => id,
                        Err(message) => return self.fail(first, message),
                    };
                    (id, None, String::new())
                };

                let pointer_level = parse_pointer_level(s);
                if s.peek().kind == TokenKind::Amp {
                    s.next();
                    let name_tok = match s.expect(TokenKind::Identifier) {
                        Ok(tok) => tok,
                        Err(tok) => return self.fail(&tok, "expected variable name"),
                    };
                    return self.parse_reference_declaration(
                        s,
                        type_id,
                        template_type_name,
                        command,
                        pointer_level,
                        &name_tok,
                    );
                }
                let name_tok = match s.expect(TokenKind::Identifier) {
                    Ok(tok) => tok,
                    Err(tok) => return self.fail(&tok, "expected variable name"),
                };
                if pointer_level > 0 {
                    return self.parse_pointer_declaration(
                        s,
                        type_id,
                        template_type_name,
                        command,
                        pointer_level,
                        &name_tok,
                    );
                }
                self.parse_object_declaration(s, type_id, template_type_name, command, &name_tok)
            }
            _ => {
                s.set_peek(first);
                let expr = self.parse_expression(s)?;
                self.expect_semicolon(s)?;
                Some(expr)
            }
        }
    }

    fn current_class_is_template_param(&self, name: &str) -> bool {
        self.current_class != INVALID_ID
            && self.program.class(self.current_class).template.is_type_param(name)
    }

    fn parse_object_declaration(
        &mut self,
        s: &mut Scanner,
        type_id: TypeId,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
        name_tok: &Token,
    ) -> Option<ExprId> {
        let slot = self.scope.add_local(
            &name_tok.text,
            TypeInfo::new(type_id, 0),
            &template_type_name,
            command.clone(),
        );

        let tok = s.next();
        match tok.kind {
            TokenKind::Semicolon => Some(self.program.arena.add(Expr::DeclareObject {
                type_id,
                slot,
                args: Vec::new(),
                call: CallInfo::unresolved(),
                template_type_name,
                command,
            })),
            TokenKind::OpenParen => {
                let args = self.parse_arguments(s)?;
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::DeclareObject {
                    type_id,
                    slot,
                    args,
                    call: CallInfo::unresolved(),
                    template_type_name,
                    command,
                }))
            }
            TokenKind::Equals => {
                let init = self.parse_expression(s)?;
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::DeclareObjectAssign {
                    type_id,
                    slot,
                    init,
                    call: CallInfo::unresolved(),
                    template_type_name,
                    command,
                }))
            }
            TokenKind::OpenBracket => {
                s.set_peek(&tok);
                let dims = self.parse_array_dimensions(s, self.current_class)?;
                let mut inits = Vec::new();
                if s.peek().kind == TokenKind::Equals {
                    s.next();
                    inits = self.parse_array_initializers(s)?;
                }
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::DeclareArray {
                    type_id,
                    elem_pointer_level: 0,
                    slot,
                    dims,
                    inits,
                    template_type_name,
                }))
            }
            _ => self.fail(&tok, "expected ';', '(', '[' or '=' in declaration"),
        }
    }

    fn parse_pointer_declaration(
        &mut self,
        s: &mut Scanner,
        type_id: TypeId,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
        pointer_level: u8,
        name_tok: &Token,
    ) -> Option<ExprId> {
        let tok = s.next();
        match tok.kind {
            TokenKind::Semicolon => {
                let slot = self.scope.add_local(
                    &name_tok.text,
                    TypeInfo::new(type_id, pointer_level),
                    &template_type_name,
                    command.clone(),
                );
                Some(self.program.arena.add(Expr::DeclarePointer {
                    type_id,
                    pointer_level,
                    slot,
                    init: None,
                    template_type_name,
                    command,
                }))
            }
            TokenKind::Equals => {
                let init = self.parse_expression(s)?;
                self.expect_semicolon(s)?;
                let slot = self.scope.add_local(
                    &name_tok.text,
                    TypeInfo::new(type_id, pointer_level),
                    &template_type_name,
                    command.clone(),
                );
                Some(self.program.arena.add(Expr::DeclarePointer {
                    type_id,
                    pointer_level,
                    slot,
                    init: Some(init),
                    template_type_name,
                    command,
                }))
            }
            TokenKind::OpenBracket => {
                s.set_peek(&tok);
                let dims = self.parse_array_dimensions(s, self.current_class)?;
                let slot = self.scope.add_local(
                    &name_tok.text,
                    TypeInfo::new(type_id, pointer_level + 1),
                    &template_type_name,
                    command.clone(),
                );
                let mut inits = Vec::new();
                if s.peek().kind == TokenKind::Equals {
                    s.next();
                    inits = self.parse_array_initializers(s)?;
                }
                self.expect_semicolon(s)?;
                Some(self.program.arena.add(Expr::DeclareArray {
                    type_id,
                    elem_pointer_level: pointer_level,
                    slot,
                    dims,
                    inits,
                    template_type_name,
                }))
            }
            _ => self.fail(&tok, "expected ';', '[' or '=' in pointer declaration"),
        }
    }

    fn parse_reference_declaration(
        &mut self,
        s: &mut Scanner,
        type_id: TypeId,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
        pointer_level: u8,
        name_tok: &Token,
    ) -> Option<ExprId> {
        if let Err(tok) = s.expect(TokenKind::Equals) {
            return self.fail(&tok, "a reference declaration requires an initializer");
        }
        let init = self.parse_expression(s)?;
        self.expect_semicolon(s)?;
        let slot = self.scope.add_local(
            &name_tok.text,
            TypeInfo::new(type_id, pointer_level),
            &template_type_name,
            command.clone(),
        );
        Some(self.program.arena.add(Expr::DeclareRef {
            type_id,
            pointer_level,
            slot,
            init,
            template_type_name,
            command,
        }))
    }

    // ---- expressions -----------------------------------------------------

    pub fn parse_expression(&mut self, s: &mut Scanner) -> Option<ExprId> {
        let lhs = self.parse_unary(s)?;
        self.parse_binary_rhs(s, 0, lhs)
    }

    fn parse_binary_rhs(&mut self, s: &mut Scanner, min_prec: i32, mut lhs: ExprId) -> Option<ExprId> {
        loop {
            let op_tok = s.peek();
            let prec = precedence(&op_tok);
            if prec < min_prec {
                return Some(lhs);
            }
            s.next();

            let mut rhs = self.parse_unary(s)?;
            let next_prec = precedence(&s.peek());
            if prec < next_prec {
                rhs = self.parse_binary_rhs(s, prec + 1, rhs)?;
            }

            let op = match op_tok.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                TokenKind::Asterisk => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                TokenKind::Less => BinOp::Less,
                TokenKind::Greater => BinOp::Greater,
                TokenKind::LessEquals => BinOp::LessEq,
                TokenKind::GreaterEquals => BinOp::GreaterEq,
                TokenKind::EqualsEquals => BinOp::Eq,
                TokenKind::NotEquals => BinOp::NotEq,
                TokenKind::Amp => BinOp::BitAnd,
                TokenKind::Pipe => BinOp::BitOr,
                TokenKind::ShiftLeft => BinOp::Shl,
                TokenKind::ShiftRight => BinOp::Shr,
                TokenKind::LogicalAnd => BinOp::LogicalAnd,
                TokenKind::LogicalOr => BinOp::LogicalOr,
                _ => return Some(lhs),
            };
            lhs = self.program.arena.add(Expr::Binary {
                op,
                lhs,
                rhs,
                call: CallInfo::unresolved(),
            });
        }
    }

    fn parse_unary(&mut self, s: &mut Scanner) -> Option<ExprId> {
        let tok = s.peek();
        match tok.kind {
            TokenKind::Asterisk => {
                s.next();
                let expr = self.parse_unary(s)?;
                Some(self.program.arena.add(Expr::Deref { expr }))
            }
            TokenKind::Amp => {
                s.next();
                let expr = self.parse_unary(s)?;
                Some(self.program.arena.add(Expr::AddressOf { expr }))
            }
            TokenKind::PlusPlus => {
                s.next();
                let expr = self.parse_unary(s)?;
                Some(self.program.arena.add(Expr::UnaryUpdate { op: UpdateOp::PreInc, expr }))
            }
            TokenKind::MinusMinus => {
                s.next();
                let expr = self.parse_unary(s)?;
                Some(self.program.arena.add(Expr::UnaryUpdate { op: UpdateOp::PreDec, expr }))
            }
            TokenKind::Not => {
                s.next();
                let expr = self.parse_unary(s)?;
                Some(self.program.arena.add(Expr::Invert { expr }))
            }
            TokenKind::Minus => {
                s.next();
                let expr = self.parse_unary(s)?;
                Some(self.program.arena.add(Expr::Negate { expr }))
            }
            TokenKind::OpenParen => self.parse_cast_or_postfix(s),
            _ => self.parse_postfix(s),
        }
    }

    /// `(X) y` is a cast only when X lexes as a type (primitive keyword,
    /// known class or template parameter, plus pointer stars) and the paren
    /// closes immediately; anything else re-parses as a parenthesised
    /// expression.
    fn parse_cast_or_postfix(&mut self, s: &mut Scanner) -> Option<ExprId> {
        let open = s.next();
        let head = s.next();

        let mut template_type_name = String::new();
        let mut type_id = self.parse_type(&head);
        if type_id == INVALID_ID
            && head.kind == TokenKind::Identifier
            && self.current_class_is_template_param(&head.text)
        {
            template_type_name = head.text.clone();
            type_id = TYPE_PLACEHOLDER;
        }

        if type_id != INVALID_ID && type_id != TYPE_VOID {
            let pointer_level = parse_pointer_level(s);
            if s.peek().kind == TokenKind::CloseParen {
                s.next();
                let expr = self.parse_expression(s)?;
                return Some(self.program.arena.add(Expr::Cast {
                    expr,
                    type_id,
                    pointer_level,
                    template_type_name,
                }));
            }
        }

        s.set_peek(&open);
        self.parse_postfix(s)
    }

    fn parse_postfix(&mut self, s: &mut Scanner) -> Option<ExprId> {
        let expr = self.parse_primary(s)?;
        let tok = s.peek();
        match tok.kind {
            TokenKind::PlusPlus => {
                s.next();
                Some(self.program.arena.add(Expr::UnaryUpdate { op: UpdateOp::PostInc, expr }))
            }
            TokenKind::MinusMinus => {
                s.next();
                Some(self.program.arena.add(Expr::UnaryUpdate { op: UpdateOp::PostDec, expr }))
            }
            TokenKind::PlusEquals
            | TokenKind::MinusEquals
            | TokenKind::TimesEquals
            | TokenKind::DivideEquals
            | TokenKind::ModEquals => {
                s.next();
                let amount = self.parse_expression(s)?;
                let op = match tok.kind {
                    TokenKind::PlusEquals => BinOp::Add,
                    TokenKind::MinusEquals => BinOp::Sub,
                    TokenKind::TimesEquals => BinOp::Mul,
                    TokenKind::DivideEquals => BinOp::Div,
                    _ => BinOp::Mod,
                };
                Some(self.program.arena.add(Expr::ArithAssign { op, target: expr, amount }))
            }
            _ => Some(expr),
        }
    }

    fn literal(&mut self, value: Value) -> ExprId {
        self.program.arena.add(Expr::Literal { value })
    }

    fn parse_primary(&mut self, s: &mut Scanner) -> Option<ExprId> {
        let tok = s.next();
        match tok.kind {
            TokenKind::NumberLiteral => {
                if tok.text.contains('.') {
                    let number: f64 = tok.text.parse().unwrap_or(0.0);
                    match Value::make_f64(number, &mut self.program.memory, Region::Init) {
                        Ok(value) => Some(self.literal(value)),
                        Err(e) => self.fail(&tok, e.to_string()),
                    }
                } else {
                    let number: i64 = tok.text.parse().unwrap_or(0);
                    match Value::make_i64(number, &mut self.program.memory, Region::Init) {
                        Ok(value) => Some(self.literal(value)),
                        Err(e) => self.fail(&tok, e.to_string()),
                    }
                }
            }
            TokenKind::StringLiteral => {
                let text = unescape(&tok.text);
                let data = match self.program.intern_string(&text) {
                    Ok(addr) => addr,
                    Err(message) => return self.fail(&tok, message),
                };
                match Value::make_cstr(data, &mut self.program.memory, Region::Init) {
                    Ok(value) => Some(self.literal(value)),
                    Err(e) => self.fail(&tok, e.to_string()),
                }
            }
            TokenKind::CharLiteral => {
                let text = unescape(&tok.text);
                let byte = text.bytes().next().unwrap_or(b'?');
                match Value::make_char(byte, &mut self.program.memory, Region::Init) {
                    Ok(value) => Some(self.literal(value)),
                    Err(e) => self.fail(&tok, e.to_string()),
                }
            }
            TokenKind::True | TokenKind::False => {
                match Value::make_bool(tok.kind == TokenKind::True, &mut self.program.memory, Region::Init)
                {
                    Ok(value) => Some(self.literal(value)),
                    Err(e) => self.fail(&tok, e.to_string()),
                }
            }
            TokenKind::Null => Some(self.literal(Value::null())),
            TokenKind::OpenParen => {
                let expr = self.parse_expression(s)?;
                if let Err(tok) = s.expect(TokenKind::CloseParen) {
                    return self.fail(&tok, "expected ')'");
                }
                self.parse_chain_suffix(s, expr)
            }
            TokenKind::New => self.parse_new(s),
            TokenKind::StrLen => {
                if let Err(tok) = s.expect(TokenKind::OpenParen) {
                    return self.fail(&tok, "expected '(' after strlen");
                }
                let expr = self.parse_expression(s)?;
                if let Err(tok) = s.expect(TokenKind::CloseParen) {
                    return self.fail(&tok, "expected ')' after strlen");
                }
                Some(self.program.arena.add(Expr::Strlen { expr }))
            }
            TokenKind::SizeOf => {
                if let Err(tok) = s.expect(TokenKind::OpenParen) {
                    return self.fail(&tok, "expected '(' after sizeof");
                }
                let type_tok = s.next();
                let mut template_type_name = String::new();
                let mut type_id = self.parse_type(&type_tok);
                if type_id == INVALID_ID {
                    if self.current_class_is_template_param(&type_tok.text) {
                        template_type_name = type_tok.text.clone();
                        type_id = TYPE_PLACEHOLDER;
                    } else {
                        return self.fail(&type_tok, format!("unknown type '{}'", type_tok.text));
                    }
                }
                let is_pointer = parse_pointer_level(s) > 0;
                if let Err(tok) = s.expect(TokenKind::CloseParen) {
                    return self.fail(&tok, "expected ')' after sizeof");
                }
                Some(self.program.arena.add(Expr::SizeOf { type_id, is_pointer, template_type_name }))
            }
            TokenKind::OffsetOf => {
                if let Err(tok) = s.expect(TokenKind::OpenParen) {
                    return self.fail(&tok, "expected '(' after offsetof");
                }
                let type_tok = s.next();
                let class_id = self.parse_type(&type_tok);
                if !is_class_type(class_id) {
                    return self.fail(&type_tok, "offsetof requires a class type");
                }
                if let Err(tok) = s.expect(TokenKind::Dot) {
                    return self.fail(&tok, "expected '.' in offsetof");
                }
                let member_tok = match s.expect(TokenKind::Identifier) {
                    Ok(tok) => tok,
                    Err(tok) => return self.fail(&tok, "expected member name in offsetof"),
                };
                if let Err(tok) = s.expect(TokenKind::CloseParen) {
                    return self.fail(&tok, "expected ')' after offsetof");
                }
                Some(self.program.arena.add(Expr::OffsetOf {
                    class_id,
                    members: vec![member_tok.text],
                    offset: u64::MAX,
                }))
            }
            TokenKind::This => {
                if s.peek().kind == TokenKind::Arrow {
                    let this = self.program.arena.add(Expr::This { class_id: self.current_class });
                    let base = self.program.arena.add(Expr::Deref { expr: this });
                    s.next();
                    return self.parse_members_onto(s, base);
                }
                Some(self.program.arena.add(Expr::This { class_id: self.current_class }))
            }
            TokenKind::Identifier => self.parse_identifier_expression(s, &tok),
            _ => self.fail(&tok, format!("unexpected token '{}' in expression", tok.text)),
        }
    }

    fn parse_new(&mut self, s: &mut Scanner) -> Option<ExprId> {
        let type_tok = s.next();
        let mut template_type_name = String::new();
        let mut type_id = self.parse_type(&type_tok);
        if type_id == INVALID_ID {
            if type_tok.kind == TokenKind::Identifier
                && self.current_class_is_template_param(&type_tok.text)
            {
                template_type_name = type_tok.text.clone();
                type_id = TYPE_PLACEHOLDER;
            } else {
                return self.fail(&type_tok, format!("unknown type '{}' after new", type_tok.text));
            }
        }
        let pointer_level = parse_pointer_level(s);

        let tok = s.next();
        match tok.kind {
            TokenKind::OpenBracket => {
                let size = self.parse_expression(s)?;
                if let Err(tok) = s.expect(TokenKind::CloseBracket) {
                    return self.fail(&tok, "expected ']' after array size");
                }
                Some(self.program.arena.add(Expr::NewArray {
                    type_id,
                    pointer_level,
                    size,
                    template_type_name,
                }))
            }
            TokenKind::OpenParen => {
                let args = self.parse_arguments(s)?;
                Some(self.program.arena.add(Expr::New {
                    type_id,
                    args,
                    call: CallInfo::unresolved(),
                    template_type_name,
                }))
            }
            _ => self.fail(&tok, "expected '[' or '(' after new"),
        }
    }

    /// The identifier resolution ladder: local slot, module, class name,
    /// static field, and finally a member of the implicit `this`.
    fn resolve_identifier(&mut self, name: &str) -> ExprId {
        let slot = self.scope.resolve(name);
        if slot != INVALID_ID {
            let decl = self.scope.declaration(slot);
            return self.program.arena.add(Expr::PushLocal {
                slot,
                type_info: decl.type_info,
                template_type_name: decl.template_type_name,
                command: decl.command,
            });
        }
        if self.current_class != INVALID_ID {
            if self
                .program
                .class(self.current_class)
                .template
                .is_int_param(name)
            {
                return self.program.arena.add(Expr::TemplateConst { name: name.to_string() });
            }
            let statics = &self.program.class(self.current_class).static_fields;
            if statics.iter().any(|f| f.name == name) {
                return self.program.arena.add(Expr::StaticVar {
                    class_id: self.current_class,
                    members: vec![name.to_string()],
                    offset: u64::MAX,
                    type_info: TypeInfo::invalid(),
                    is_array: false,
                });
            }
        }
        let this = self.program.arena.add(Expr::This { class_id: self.current_class });
        let base = self.program.arena.add(Expr::Deref { expr: this });
        self.program.arena.add(Expr::PushMember {
            base,
            members: vec![name.to_string()],
            type_info: TypeInfo::invalid(),
            is_array: false,
            offset: u64::MAX,
        })
    }

    fn parse_identifier_expression(&mut self, s: &mut Scanner, first: &Token) -> Option<ExprId> {
        let next = s.next();
        match next.kind {
            TokenKind::OpenParen => {
                let args = self.parse_arguments(s)?;
                if self.current_class_is_template_param(&first.text) {
                    let expr = self.program.arena.add(Expr::ConstructorCall {
                        type_id: TYPE_PLACEHOLDER,
                        args,
                        call: CallInfo::unresolved(),
                        template_type_name: first.text.clone(),
                        command: None,
                    });
                    return self.parse_chain_suffix(s, expr);
                }
                let class_id = self.program.class_id(&first.text);
                if class_id != INVALID_ID {
                    let expr = self.program.arena.add(Expr::ConstructorCall {
                        type_id: class_id,
                        args,
                        call: CallInfo::unresolved(),
                        template_type_name: String::new(),
                        command: None,
                    });
                    return self.parse_chain_suffix(s, expr);
                }
                let expr = self.program.arena.add(Expr::StaticCall {
                    class_id: self.current_class,
                    name: first.text.clone(),
                    args,
                    call: CallInfo::unresolved(),
                });
                self.parse_chain_suffix(s, expr)
            }

            TokenKind::Less if self.program.class_id(&first.text) != INVALID_ID
                && self.program.class(self.program.class_id(&first.text)).is_template_class() =>
            {
                // Vec<int32>(...) constructor call
                let template_id = self.program.class_id(&first.text);
                let (inst, cmd, has_placeholder) = self.parse_template_args(s, template_id)?;
                let (type_id, command, template_type_name) = if has_placeholder {
                    (TYPE_PLACEHOLDER, Some(cmd), String::new())
                } else {
                    let id = match self.program.instantiate_template(template_id, &inst) {
                        Ok(id) => id,
                        Err(message) => return self.fail(first, message),
                    };
                    (id, None, String::new())
                };
                if let Err(tok) = s.expect(TokenKind::OpenParen) {
                    return self.fail(&tok, "expected '(' after template arguments");
                }
                let args = self.parse_arguments(s)?;
                Some(self.program.arena.add(Expr::ConstructorCall {
                    type_id,
                    args,
                    call: CallInfo::unresolved(),
                    template_type_name,
                    command,
                }))
            }

            TokenKind::Dot | TokenKind::Arrow => {
                // module, static or member chain
                if next.kind == TokenKind::Dot {
                    let module = self.program.module_id(&first.text);
                    if module != INVALID_ID {
                        return self.parse_module_access(s, module, first);
                    }
                    let class_id = self.program.class_id(&first.text);
                    if class_id != INVALID_ID {
                        return self.parse_static_access(s, class_id);
                    }
                }
                let base = self.resolve_identifier(&first.text);
                let base = if next.kind == TokenKind::Arrow {
                    self.program.arena.add(Expr::Deref { expr: base })
                } else {
                    base
                };
                self.parse_members_onto(s, base)
            }

            TokenKind::Equals => {
                let target = self.resolve_identifier(&first.text);
                let value = self.parse_expression(s)?;
                Some(self.program.arena.add(Expr::Set {
                    target,
                    value,
                    call: CallInfo::unresolved(),
                }))
            }

            TokenKind::OpenBracket => {
                let base = self.resolve_identifier(&first.text);
                let indices = self.parse_array_indices(s)?;
                let indexed = self.program.arena.add(Expr::PushIndexed {
                    base,
                    indices,
                    call: CallInfo::unresolved(),
                });
                if s.peek().kind == TokenKind::Equals {
                    s.next();
                    let value = self.parse_expression(s)?;
                    return Some(self.program.arena.add(Expr::Set {
                        target: indexed,
                        value,
                        call: CallInfo::unresolved(),
                    }));
                }
                self.parse_chain_suffix(s, indexed)
            }

            _ => {
                s.set_peek(&next);
                Some(self.resolve_identifier(&first.text))
            }
        }
    }

    /// `Module.Name(...)` or `Module.CONSTANT`; called with the '.' consumed.
    fn parse_module_access(&mut self, s: &mut Scanner, module: u16, module_tok: &Token) -> Option<ExprId> {
        let name_tok = match s.expect(TokenKind::Identifier) {
            Ok(tok) => tok,
            Err(tok) => return self.fail(&tok, "expected name after module"),
        };
        if s.peek().kind == TokenKind::OpenParen {
            s.next();
            let args = self.parse_arguments(s)?;
            let function = match modules::function_id(module, &name_tok.text) {
                Some(id) => id,
                None => {
                    return self.fail(
                        &name_tok,
                        format!("module {} has no function '{}'", module_tok.text, name_tok.text),
                    )
                }
            };
            return Some(self.program.arena.add(Expr::ModuleCall { module, function, args }));
        }
        let constant = match modules::constant_id(module, &name_tok.text) {
            Some(id) => id,
            None => {
                return self.fail(
                    &name_tok,
                    format!("module {} has no constant '{}'", module_tok.text, name_tok.text),
                )
            }
        };
        Some(self.program.arena.add(Expr::ModuleConstant { module, constant }))
    }

    /// `Class.member...` or `Class.Method(...)`; called with the '.' consumed.
    fn parse_static_access(&mut self, s: &mut Scanner, class_id: TypeId) -> Option<ExprId> {
        let name_tok = match s.expect(TokenKind::Identifier) {
            Ok(tok) => tok,
            Err(tok) => return self.fail(&tok, "expected name after class"),
        };
        if s.peek().kind == TokenKind::OpenParen {
            s.next();
            let args = self.parse_arguments(s)?;
            let expr = self.program.arena.add(Expr::StaticCall {
                class_id,
                name: name_tok.text,
                args,
                call: CallInfo::unresolved(),
            });
            return self.parse_chain_suffix(s, expr);
        }

        let mut members = vec![name_tok.text];
        while s.peek().kind == TokenKind::Dot {
            s.next();
            let tok = match s.expect(TokenKind::Identifier) {
                Ok(tok) => tok,
                Err(tok) => return self.fail(&tok, "expected member name"),
            };
            members.push(tok.text);
        }
        let expr = self.program.arena.add(Expr::StaticVar {
            class_id,
            members,
            offset: u64::MAX,
            type_info: TypeInfo::invalid(),
            is_array: false,
        });
        self.parse_chain_suffix(s, expr)
    }

    /// Member accesses hanging off `base`; the scanner is positioned right
    /// after the '.' or '->' that introduced the chain. Pointer hops split
    /// the accumulated path with a dereference.
    fn parse_members_onto(&mut self, s: &mut Scanner, base: ExprId) -> Option<ExprId> {
        let mut expr = base;
        let mut path: Vec<String> = Vec::new();

        loop {
            let name_tok = match s.expect(TokenKind::Identifier) {
                Ok(tok) => tok,
                Err(tok) => return self.fail(&tok, "expected member name"),
            };

            let after = s.peek();
            match after.kind {
                TokenKind::OpenParen => {
                    s.next();
                    let args = self.parse_arguments(s)?;
                    if !path.is_empty() {
                        expr = self.program.arena.add(Expr::PushMember {
                            base: expr,
                            members: std::mem::take(&mut path),
                            type_info: TypeInfo::invalid(),
                            is_array: false,
                            offset: u64::MAX,
                        });
                    }
                    let call = self.program.arena.add(Expr::MemberCall {
                        base: expr,
                        name: name_tok.text,
                        args,
                        call: CallInfo::unresolved(),
                    });
                    return self.parse_chain_suffix(s, call);
                }
                TokenKind::Dot => {
                    s.next();
                    path.push(name_tok.text);
                }
                TokenKind::Arrow => {
                    s.next();
                    path.push(name_tok.text);
                    expr = self.program.arena.add(Expr::PushMember {
                        base: expr,
                        members: std::mem::take(&mut path),
                        type_info: TypeInfo::invalid(),
                        is_array: false,
                        offset: u64::MAX,
                    });
                    expr = self.program.arena.add(Expr::Deref { expr });
                }
                _ => {
                    path.push(name_tok.text);
                    expr = self.program.arena.add(Expr::PushMember {
                        base: expr,
                        members: path,
                        type_info: TypeInfo::invalid(),
                        is_array: false,
                        offset: u64::MAX,
                    });
                    return self.parse_chain_suffix(s, expr);
                }
            }
        }
    }

    /// Indexing, assignment and further member accesses after a complete
    /// place or call expression.
    fn parse_chain_suffix(&mut self, s: &mut Scanner, expr: ExprId) -> Option<ExprId> {
        let tok = s.peek();
        match tok.kind {
            TokenKind::OpenBracket => {
                s.next();
                let indices = self.parse_array_indices(s)?;
                let indexed = self.program.arena.add(Expr::PushIndexed {
                    base: expr,
                    indices,
                    call: CallInfo::unresolved(),
                });
                self.parse_chain_suffix(s, indexed)
            }
            TokenKind::Equals => {
                s.next();
                let value = self.parse_expression(s)?;
                Some(self.program.arena.add(Expr::Set {
                    target: expr,
                    value,
                    call: CallInfo::unresolved(),
                }))
            }
            TokenKind::Dot => {
                s.next();
                self.parse_members_onto(s, expr)
            }
            TokenKind::Arrow => {
                s.next();
                let base = self.program.arena.add(Expr::Deref { expr });
                self.parse_members_onto(s, base)
            }
            _ => Some(expr),
        }
    }

    // ---- small helpers ---------------------------------------------------

    fn parse_arguments(&mut self, s: &mut Scanner) -> Option<Vec<ExprId>> {
        let mut args = Vec::new();
        if s.peek().kind == TokenKind::CloseParen {
            s.next();
            return Some(args);
        }
        loop {
            args.push(self.parse_expression(s)?);
            let sep = s.next();
            match sep.kind {
                TokenKind::Comma => continue,
                TokenKind::CloseParen => break,
                _ => return self.fail(&sep, "expected ',' or ')' in arguments"),
            }
        }
        Some(args)
    }

    /// `[3][4]`... extents; an identifier names a template int parameter.
    fn parse_array_dimensions(&mut self, s: &mut Scanner, class_id: TypeId) -> Option<Vec<(u32, String)>> {
        let mut dims = Vec::new();
        while s.peek().kind == TokenKind::OpenBracket {
            s.next();
            let tok = s.next();
            match tok.kind {
                TokenKind::NumberLiteral => {
                    let extent: u32 = tok.text.parse().unwrap_or(0);
                    dims.push((extent, String::new()));
                }
                TokenKind::Identifier => {
                    if class_id != INVALID_ID
                        && self.program.class(class_id).template.is_int_param(&tok.text)
                    {
                        dims.push((0, tok.text));
                    } else {
                        return self.fail(&tok, "array extents must be integer literals");
                    }
                }
                _ => return self.fail(&tok, "expected array extent"),
            }
            if let Err(tok) = s.expect(TokenKind::CloseBracket) {
                return self.fail(&tok, "expected ']' after array extent");
            }
        }
        Some(dims)
    }

    /// `{ a, b, ... }` with nested braces flattened in element order.
    fn parse_array_initializers(&mut self, s: &mut Scanner) -> Option<Vec<ExprId>> {
        if let Err(tok) = s.expect(TokenKind::OpenBrace) {
            return self.fail(&tok, "expected '{' to open array initializer");
        }
        let mut inits = Vec::new();
        loop {
            let tok = s.peek();
            match tok.kind {
                TokenKind::OpenBrace => {
                    let nested = self.parse_array_initializers(s)?;
                    inits.extend(nested);
                }
                TokenKind::CloseBrace => {}
                _ => inits.push(self.parse_expression(s)?),
            }
            let sep = s.next();
            match sep.kind {
                TokenKind::CloseBrace => break,
                TokenKind::Comma => continue,
                _ => return self.fail(&sep, "expected ',' or '}' in array initializer"),
            }
        }
        Some(inits)
    }

    /// Index list after the first '[': `i][j]`...
    fn parse_array_indices(&mut self, s: &mut Scanner) -> Option<Vec<ExprId>> {
        let mut indices = Vec::new();
        loop {
            indices.push(self.parse_expression(s)?);
            if let Err(tok) = s.expect(TokenKind::CloseBracket) {
                return self.fail(&tok, "expected ']' after index");
            }
            if s.peek().kind == TokenKind::OpenBracket {
                s.next();
                continue;
            }
            break;
        }
        Some(indices)
    }
}

fn parse_pointer_level(s: &mut Scanner) -> u8 {
    let mut level = 0;
    while s.peek().kind == TokenKind::Asterisk {
        s.next();
        level += 1;
    }
    level
}

fn precedence(tok: &Token) -> i32 {
    match tok.kind {
        TokenKind::Asterisk | TokenKind::Slash | TokenKind::Percent => 20,
        TokenKind::Plus | TokenKind::Minus => 10,
        TokenKind::ShiftLeft | TokenKind::ShiftRight => 9,
        TokenKind::Less | TokenKind::LessEquals | TokenKind::Greater | TokenKind::GreaterEquals => 8,
        TokenKind::EqualsEquals | TokenKind::NotEquals => 7,
        TokenKind::Amp => 6,
        TokenKind::Pipe => 5,
        TokenKind::LogicalAnd => 3,
        TokenKind::LogicalOr => 2,
        _ => -1,
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn skip_statement(s: &mut Scanner) {
    let mut depth = 0;
    loop {
        let tok = s.next();
        match tok.kind {
            TokenKind::End => break,
            TokenKind::OpenBrace => depth += 1,
            TokenKind::CloseBrace => {
                depth -= 1;
                if depth <= 0 {
                    break;
                }
            }
            TokenKind::Semicolon if depth == 0 => break,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use crate::config::Settings;

    fn parse(source: &str) -> (Program, Vec<CompileError>) {
        let mut program = Program::new(Settings::default());
        let mut parser = Parser::new(&mut program);
        parser.parse_source(source, Path::new("."));
        let errors = parser.into_errors();
        (program, errors)
    }

    fn parse_ok(source: &str) -> Program {
        let (program, errors) = parse(source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        program
    }

    #[test]
    fn two_pass_classes_allow_forward_member_references() {
        let program = parse_ok(
            r#"
            class C {
                int32 use_it() { return later; }
                int32 later;
            }
            "#,
        );
        let cls = program.class(program.class_id("C"));
        assert_eq!(cls.member_fields.len(), 1);
        assert_eq!(cls.functions.len(), 1);
        assert_eq!(cls.size, 4);
    }

    #[test]
    fn field_layout_accounts_for_headers_and_hidden_words() {
        let program = parse_ok(
            r#"
            class Inner { int32 a; }
            class Outer {
                int32 x;
                Inner inner;
                int32 xs[4];
                Inner* p;
            }
            "#,
        );
        let outer = program.class(program.class_id("Outer"));
        let fields = &outer.member_fields;
        assert_eq!(fields[0].offset, 0); // x
        // inner payload sits after its hidden class-id word
        assert_eq!(fields[1].offset, 4 + 8);
        // array elements sit after their header
        let xs_offset = 4 + 8 + 4;
        assert_eq!(fields[2].offset, xs_offset as u64 + 34);
        assert_eq!(fields[2].type_info.pointer_level, 1);
        // pointer field is one word
        assert_eq!(fields[3].size, 8);
    }

    #[test]
    fn derived_fields_follow_the_base_payload() {
        let program = parse_ok(
            r#"
            class Base { int32 a; int32 b; }
            class Derived -> inherit[Base] { int32 c; }
            "#,
        );
        let derived = program.class(program.class_id("Derived"));
        assert_eq!(derived.base, Some(program.class_id("Base")));
        assert_eq!(derived.member_fields[0].offset, 8);
        assert_eq!(derived.size, 12);
    }

    #[test]
    fn functions_register_overloads_and_flags() {
        let program = parse_ok(
            r#"
            class C {
                static void f(int32 a) { }
                static void f(real64 a) { }
                virtual int32 g() { return 0; }
                C() { }
                ~C() { }
                void operator=(C other) { }
            }
            "#,
        );
        let cls = program.class(program.class_id("C"));
        assert_eq!(cls.overloads.get("f").map(|v| v.len()), Some(2));
        assert!(cls.function(cls.overloads["f"][0]).is_static());
        assert!(cls.function(cls.overloads["g"][0]).is_virtual());
        assert!(cls.default_ctor.is_some());
        assert!(cls.destructor.is_some());
        assert!(cls.assign_fn.is_some());
    }

    #[test]
    fn statements_build_the_expected_nodes() {
        let program = parse_ok(
            r#"
            class C {
                static void Main() {
                    int32 x = 1;
                    int32* p = &x;
                    int32& r = x;
                    int32 xs[2] = {1, 2};
                    x += 2;
                    x++;
                    if (x < 3) { x = 0; } else x = 1;
                    for (int32 i = 0; i < 3; i++) { }
                    while (x > 0) { break; }
                    return;
                }
            }
            "#,
        );
        let body = &program.class(program.class_id("C")).functions[0].body;
        assert!(matches!(program.arena.get(body[0]), Expr::DeclarePrim { .. }));
        assert!(matches!(program.arena.get(body[1]), Expr::DeclarePointer { .. }));
        assert!(matches!(program.arena.get(body[2]), Expr::DeclareRef { .. }));
        assert!(matches!(program.arena.get(body[3]), Expr::DeclareArray { .. }));
        assert!(matches!(program.arena.get(body[4]), Expr::ArithAssign { .. }));
        assert!(matches!(program.arena.get(body[5]), Expr::UnaryUpdate { .. }));
        assert!(matches!(program.arena.get(body[6]), Expr::IfElse { then_scope: true, else_scope: false, .. }));
        assert!(matches!(program.arena.get(body[7]), Expr::For { .. }));
        assert!(matches!(program.arena.get(body[8]), Expr::While { .. }));
        assert!(matches!(program.arena.get(body[9]), Expr::Return { expr: None, .. }));
    }

    #[test]
    fn precedence_climbs() {
        let program = parse_ok(
            r#"
            class C {
                static int32 f() { return 1 + 2 * 3; }
            }
            "#,
        );
        let body = &program.class(program.class_id("C")).functions[0].body;
        let ret = program.arena.get(body[0]);
        let expr = match ret {
            Expr::Return { expr: Some(e), .. } => *e,
            other => panic!("expected return, got {:?}", other),
        };
        match program.arena.get(expr) {
            Expr::Binary { op: crate::ast::BinOp::Add, rhs, .. } => {
                assert!(matches!(
                    program.arena.get(*rhs),
                    Expr::Binary { op: crate::ast::BinOp::Mul, .. }
                ));
            }
            other => panic!("expected binary add at the root, got {:?}", other),
        }
    }

    #[test]
    fn cast_requires_a_type_in_parens() {
        let program = parse_ok(
            r#"
            class C {
                static int32 f(real64 r) { return (int32) r; }
                static int32 g(int32 a) { return (a); }
            }
            "#,
        );
        let cls = program.class(program.class_id("C"));
        let f_ret = match program.arena.get(cls.functions[0].body[0]) {
            Expr::Return { expr: Some(e), .. } => *e,
            _ => unreachable!(),
        };
        assert!(matches!(program.arena.get(f_ret), Expr::Cast { .. }));
        let g_ret = match program.arena.get(cls.functions[1].body[0]) {
            Expr::Return { expr: Some(e), .. } => *e,
            _ => unreachable!(),
        };
        assert!(matches!(program.arena.get(g_ret), Expr::PushLocal { .. }));
    }

    #[test]
    fn templates_record_parameters_and_instantiate_on_use() {
        let program = parse_ok(
            r#"
            class Pair -> template[class T, uint32 N] {
                T items[N];
            }
            class C {
                static void Main() {
                    Pair<int32, 4> p;
                }
            }
            "#,
        );
        let pair = program.class(program.class_id("Pair"));
        assert!(pair.is_template_class());
        assert_eq!(pair.template.params.len(), 2);

        let instance_id = program.class_id("Pair<int32,4>");
        assert_ne!(instance_id, INVALID_ID);
        let instance = program.class(instance_id);
        assert!(instance.is_template_instance);
        assert_eq!(instance.member_fields[0].dims, vec![(4, String::new())]);
        // 34-byte header + 4 ints
        assert_eq!(instance.size, 34 + 16);
    }

    #[test]
    fn parse_errors_recover_and_accumulate() {
        let (_, errors) = parse(
            r#"
            class C {
                static void a() { int32 x = ; }
                static void b() { @ }
                static void c() { int32 ok = 1; }
            }
            "#,
        );
        assert!(errors.len() >= 2, "expected several diagnostics, got {:?}", errors);
    }

    #[test]
    fn unknown_module_and_duplicate_class_are_errors() {
        let (_, errors) = parse(
            r#"
            Import Bogus;
            class C { }
            class C { }
            "#,
        );
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("Bogus"));
        assert!(errors[1].message.contains("already defined"));
    }

    #[test]
    fn member_chains_split_at_arrows() {
        let program = parse_ok(
            r#"
            class Node {
                Node* next;
                int32 value;
                static int32 f(Node* n) { return n->next->value; }
            }
            "#,
        );
        let cls = program.class(program.class_id("Node"));
        let ret = match program.arena.get(cls.functions[0].body[0]) {
            Expr::Return { expr: Some(e), .. } => *e,
            _ => unreachable!(),
        };
        // value is read off a dereferenced pointer member
        match program.arena.get(ret) {
            Expr::PushMember { base, members, .. } => {
                assert_eq!(members, &vec![String::from("value")]);
                assert!(matches!(program.arena.get(*base), Expr::Deref { .. }));
            }
            other => panic!("expected member push, got {:?}", other),
        }
    }
}
